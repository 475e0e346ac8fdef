use percent_encoding::percent_decode_str;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// 用户名/密码字段各只有一个字节的长度
pub const MAX_CREDENTIAL_LEN: usize = 255;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SOCKS5 服务器地址无效: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("不支持的代理协议: {0}")]
    UnsupportedScheme(String),
    #[error("SOCKS5 服务器地址缺少主机")]
    MissingHost,
    #[error("SOCKS5 服务器地址缺少端口")]
    MissingPort,
    #[error("{0} 超过 255 字节")]
    CredentialTooLong(&'static str),
}

/// 上游认证信息。password 为 None 表示 URL 里只有用户名, 没有 `:`。
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// 上游 SOCKS5 服务器, 启动时解析一次, 之后只读共享
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEndpoint {
    host: String,
    port: u16,
    credentials: Option<Credentials>,
}

impl UpstreamEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        UpstreamEndpoint {
            host: host.into(),
            port,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password,
        });
        self
    }

    /// 解析 `socks5://[user[:pass]@]host:port`
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(input)?;

        match url.scheme() {
            "socks5" | "socks5h" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }

        let host = match url.host() {
            Some(url::Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(ConfigError::MissingHost),
        };
        let port = url.port().ok_or(ConfigError::MissingPort)?;

        let username = decode_userinfo(url.username());
        let password = match url.password() {
            Some(raw) => Some(decode_userinfo(raw)),
            // url 会把 "user:@" 规范成 "user@", 这里按原始输入还原空密码
            None if has_password_marker(input) => Some(String::new()),
            None => None,
        };
        if username.len() > MAX_CREDENTIAL_LEN {
            return Err(ConfigError::CredentialTooLong("用户名"));
        }
        if password.as_ref().is_some_and(|p| p.len() > MAX_CREDENTIAL_LEN) {
            return Err(ConfigError::CredentialTooLong("密码"));
        }

        let credentials = if username.is_empty() && password.is_none() {
            None
        } else {
            Some(Credentials { username, password })
        };

        Ok(UpstreamEndpoint {
            host,
            port,
            credentials,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// host:port, IPv6 带方括号
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// 给 HTTP 转发客户端用的代理 URL, 域名交给上游解析
    pub fn proxy_url(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&format!("socks5h://{}", self.authority()))?;
        if let Some(creds) = &self.credentials {
            // 非特殊 scheme 且有主机时 set_username/set_password 不会失败
            let _ = url.set_username(&creds.username);
            let _ = url.set_password(creds.password.as_deref());
        }
        Ok(url)
    }
}

impl fmt::Display for UpstreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socks5://{}", self.authority())
    }
}

/// authority 的 userinfo 部分里是否出现了 ':'
fn has_password_marker(input: &str) -> bool {
    let Some((_, rest)) = input.split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    match authority.rsplit_once('@') {
        Some((userinfo, _)) => userinfo.contains(':'),
        None => false,
    }
}

fn decode_userinfo(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// 进程配置, 启动时构造, 通过 Arc 传给各个组件
#[derive(Debug, Clone)]
pub struct Config {
    pub verbose: bool,
    pub listen_addr: SocketAddr,
    pub upstream: UpstreamEndpoint,
    pub dial_timeout: Duration,
    pub keep_alive: Duration,
    pub handshake_timeout: Option<Duration>,
}

impl Config {
    pub fn new(listen_addr: SocketAddr, upstream: UpstreamEndpoint) -> Self {
        Config {
            verbose: false,
            listen_addr,
            upstream,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            handshake_timeout: None,
        }
    }
}
