use crate::address::{AddressError, TargetAddress};
use crate::config::{Credentials, MAX_CREDENTIAL_LEN, UpstreamEndpoint};
use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

pub const SOCKS_VERSION: u8 = 0x05;
pub const AUTH_VERSION: u8 = 0x01;
pub const NO_AUTHENTICATION: u8 = 0x00;
pub const USERNAME_PASSWORD: u8 = 0x02;
pub const NO_ACCEPTABLE_METHODS: u8 = 0xFF;
pub const CONNECT_COMMAND: u8 = 0x01;
pub const RESERVED: u8 = 0x00;
pub const SUCCEEDED: u8 = 0x00;

/// 方法选择回复: VER METHOD
const METHOD_REPLY_LEN: usize = 2;
/// 认证回复: VER STATUS
const AUTH_REPLY_LEN: usize = 2;
/// CONNECT 回复的状态部分: VER REP
const CONNECT_STATUS_LEN: usize = 2;
/// 状态之后的 RSV ATYP, 再往后是 BND.ADDR BND.PORT
const CONNECT_ADDR_HEADER_LEN: usize = 2;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("无法连接 SOCKS5 服务器 {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("连接 SOCKS5 服务器 {addr} 超时 ({timeout:?})")]
    DialTimeout { addr: String, timeout: Duration },
    #[error("SOCKS5 服务器要求的认证方式暂不支持: 0x{0:02x}")]
    UnsupportedAuthMethod(u8),
    #[error("SOCKS5 服务器要求用户名/密码认证")]
    AuthMethodRequired,
    #[error("SOCKS5 服务器地址无效: 缺少密码")]
    MalformedEndpoint,
    #[error("SOCKS5 服务器认证失败 (状态 0x{0:02x})")]
    AuthFailed(u8),
    #[error("SOCKS5 服务器返回连接失败: {}", describe_reply(.0))]
    ConnectionRefused(u8),
    #[error("SOCKS5 握手超时 ({0:?})")]
    Timeout(Duration),
    #[error("SOCKS5 握手 I/O 错误: {0}")]
    Io(#[from] io::Error),
}

/// RFC 1928 第 6 节的 REP 字段
pub fn reply_message(rep: u8) -> &'static str {
    match rep {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned reply code",
    }
}

fn describe_reply(rep: &u8) -> &'static str {
    reply_message(*rep)
}

#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    pub dial_timeout: Duration,
    /// None 时握手读写没有超时
    pub handshake_timeout: Option<Duration>,
    /// 打印服务器回复的绑定地址
    pub verbose: bool,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        HandshakeOptions {
            dial_timeout: crate::config::DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: None,
            verbose: false,
        }
    }
}

/// 连接上游并完成握手, 返回可以直接转发的连接。
/// 失败时连接在返回前已经关闭。
pub async fn connect(
    endpoint: &UpstreamEndpoint,
    target: &TargetAddress,
    options: &HandshakeOptions,
) -> Result<TcpStream, HandshakeError> {
    let mut stream = dial(endpoint, options.dial_timeout).await?;

    let mut handshake = Handshake::new(&mut stream, endpoint, options);
    match options.handshake_timeout {
        Some(limit) => tokio::time::timeout(limit, handshake.run(target))
            .await
            .map_err(|_| HandshakeError::Timeout(limit))??,
        None => handshake.run(target).await?,
    }

    Ok(stream)
}

async fn dial(endpoint: &UpstreamEndpoint, timeout: Duration) -> Result<TcpStream, HandshakeError> {
    let addr = endpoint.authority();
    let connecting = TcpStream::connect((endpoint.host(), endpoint.port()));
    match tokio::time::timeout(timeout, connecting).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("设置 TCP_NODELAY 失败 {}: {}", addr, e);
            }
            Ok(stream)
        }
        Ok(Err(source)) => Err(HandshakeError::Dial { addr, source }),
        Err(_) => Err(HandshakeError::DialTimeout { addr, timeout }),
    }
}

/// 一次握手的状态, 握手期间独占上游连接
pub struct Handshake<'a, S> {
    stream: &'a mut S,
    endpoint: &'a UpstreamEndpoint,
    verbose: bool,
}

impl<'a, S> Handshake<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: &'a mut S, endpoint: &'a UpstreamEndpoint, options: &HandshakeOptions) -> Self {
        Handshake {
            stream,
            endpoint,
            verbose: options.verbose,
        }
    }

    pub async fn run(&mut self, target: &TargetAddress) -> Result<(), HandshakeError> {
        match self.negotiate_method().await? {
            NO_AUTHENTICATION => {}
            USERNAME_PASSWORD => self.authenticate().await?,
            other => return Err(HandshakeError::UnsupportedAuthMethod(other)),
        }
        self.request_connect(target).await
    }

    /// 提供两种方法: 0x00 无认证, 0x02 用户名/密码
    async fn negotiate_method(&mut self) -> Result<u8, HandshakeError> {
        self.stream
            .write_all(&[SOCKS_VERSION, 2, NO_AUTHENTICATION, USERNAME_PASSWORD])
            .await?;

        let mut reply = [0u8; METHOD_REPLY_LEN];
        self.stream.read_exact(&mut reply).await?;
        if reply[1] == NO_ACCEPTABLE_METHODS {
            debug!("SOCKS5 服务器不接受任何提供的认证方式");
        }
        Ok(reply[1])
    }

    async fn authenticate(&mut self) -> Result<(), HandshakeError> {
        let (username, password) = match self.endpoint.credentials() {
            Some(Credentials { username, password }) if !username.is_empty() => {
                (username.as_str(), password.as_deref())
            }
            _ => return Err(HandshakeError::AuthMethodRequired),
        };
        let password = password.ok_or(HandshakeError::MalformedEndpoint)?;
        if username.len() > MAX_CREDENTIAL_LEN || password.len() > MAX_CREDENTIAL_LEN {
            return Err(HandshakeError::MalformedEndpoint);
        }

        let mut frame = BytesMut::with_capacity(3 + username.len() + password.len());
        frame.put_u8(AUTH_VERSION);
        frame.put_u8(username.len() as u8);
        frame.put_slice(username.as_bytes());
        frame.put_u8(password.len() as u8);
        frame.put_slice(password.as_bytes());
        self.stream.write_all(&frame).await?;

        let mut reply = [0u8; AUTH_REPLY_LEN];
        self.stream.read_exact(&mut reply).await?;
        if reply[1] != SUCCEEDED {
            return Err(HandshakeError::AuthFailed(reply[1]));
        }
        Ok(())
    }

    async fn request_connect(&mut self, target: &TargetAddress) -> Result<(), HandshakeError> {
        let mut frame = BytesMut::with_capacity(3 + 1 + 1 + 255 + 2);
        frame.put_u8(SOCKS_VERSION);
        frame.put_u8(CONNECT_COMMAND);
        frame.put_u8(RESERVED);
        target.encode(&mut frame);
        self.stream.write_all(&frame).await?;

        let mut status = [0u8; CONNECT_STATUS_LEN];
        self.stream.read_exact(&mut status).await?;
        if status[1] != SUCCEEDED {
            return Err(HandshakeError::ConnectionRefused(status[1]));
        }

        self.read_bound_address().await
    }

    /// 读掉回复剩下的 RSV ATYP BND.ADDR BND.PORT, 避免残留字节混进隧道。
    /// 地址只用于日志, 无法识别的类型不算握手失败。
    async fn read_bound_address(&mut self) -> Result<(), HandshakeError> {
        let mut header = [0u8; CONNECT_ADDR_HEADER_LEN];
        self.stream.read_exact(&mut header).await?;

        match TargetAddress::read_from(&mut *self.stream, header[1]).await? {
            Ok(bound) => {
                if self.verbose {
                    info!("SOCKS5 服务器绑定地址 {}", bound);
                }
            }
            Err(AddressError::UnknownAddressType(atyp)) => {
                warn!(
                    "SOCKS5 回复的绑定地址类型无法识别: 0x{:02x}, 回复剩余字节未读取, 可能混入隧道",
                    atyp
                );
            }
            Err(e) => warn!("SOCKS5 回复的绑定地址无法解析: {}", e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;

    const IPV4_BOUND_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90];

    fn example_ipv4() -> TargetAddress {
        TargetAddress::ipv4(Ipv4Addr::new(93, 184, 216, 34), 443)
    }

    async fn expect(server: &mut DuplexStream, bytes: &[u8]) {
        let mut buf = vec![0u8; bytes.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, bytes);
    }

    #[tokio::test]
    async fn test_no_auth_connect_ipv4() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let endpoint = UpstreamEndpoint::new("127.0.0.1", 1080);

        let upstream = tokio::spawn(async move {
            expect(&mut server, &[0x05, 0x02, 0x00, 0x02]).await;
            server.write_all(&[0x05, 0x00]).await.unwrap();
            expect(
                &mut server,
                &[0x05, 0x01, 0x00, 0x01, 0x5D, 0xB8, 0xD8, 0x22, 0x01, 0xBB],
            )
            .await;
            server.write_all(&IPV4_BOUND_REPLY).await.unwrap();
            server.write_all(b"tls bytes").await.unwrap();
            server
        });

        let options = HandshakeOptions::default();
        Handshake::new(&mut client, &endpoint, &options)
            .run(&example_ipv4())
            .await
            .unwrap();

        // 回复被完整读掉, 后面的数据原样留给隧道
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tls bytes");
        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_username_password_frame() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let endpoint = UpstreamEndpoint::new("127.0.0.1", 1080)
            .with_credentials("alice", Some("secret".to_string()));

        let upstream = tokio::spawn(async move {
            expect(&mut server, &[0x05, 0x02, 0x00, 0x02]).await;
            server.write_all(&[0x05, 0x02]).await.unwrap();
            expect(
                &mut server,
                &[
                    0x01, 0x05, 0x61, 0x6C, 0x69, 0x63, 0x65, 0x06, 0x73, 0x65, 0x63, 0x72, 0x65,
                    0x74,
                ],
            )
            .await;
            server.write_all(&[0x01, 0x00]).await.unwrap();
            expect(
                &mut server,
                &[0x05, 0x01, 0x00, 0x01, 0x5D, 0xB8, 0xD8, 0x22, 0x01, 0xBB],
            )
            .await;
            server.write_all(&IPV4_BOUND_REPLY).await.unwrap();
        });

        let options = HandshakeOptions::default();
        Handshake::new(&mut client, &endpoint, &options)
            .run(&example_ipv4())
            .await
            .unwrap();
        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_failed_sends_no_connect() {
        let endpoint = UpstreamEndpoint::new("127.0.0.1", 1080)
            .with_credentials("alice", Some("secret".to_string()));
        let (mut client, mut server) = tokio::io::duplex(1024);

        let upstream = tokio::spawn(async move {
            expect(&mut server, &[0x05, 0x02, 0x00, 0x02]).await;
            server.write_all(&[0x05, 0x02]).await.unwrap();
            let mut auth = [0u8; 14];
            server.read_exact(&mut auth).await.unwrap();
            server.write_all(&[0x01, 0x01]).await.unwrap();

            let mut rest = Vec::new();
            server.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let options = HandshakeOptions::default();
        let result = Handshake::new(&mut client, &endpoint, &options)
            .run(&example_ipv4())
            .await;
        drop(client);

        assert!(matches!(result, Err(HandshakeError::AuthFailed(0x01))));
        assert!(upstream.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlisted_method_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let endpoint = UpstreamEndpoint::new("127.0.0.1", 1080);

        let upstream = tokio::spawn(async move {
            expect(&mut server, &[0x05, 0x02, 0x00, 0x02]).await;
            server.write_all(&[0x05, 0x03]).await.unwrap();
            let mut rest = Vec::new();
            server.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let options = HandshakeOptions::default();
        let result = Handshake::new(&mut client, &endpoint, &options)
            .run(&example_ipv4())
            .await;
        drop(client);

        assert!(matches!(result, Err(HandshakeError::UnsupportedAuthMethod(0x03))));
        assert!(upstream.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auth_required_without_username() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let endpoint = UpstreamEndpoint::new("127.0.0.1", 1080);

        tokio::spawn(async move {
            expect(&mut server, &[0x05, 0x02, 0x00, 0x02]).await;
            server.write_all(&[0x05, 0x02]).await.unwrap();
            let mut rest = Vec::new();
            let _ = server.read_to_end(&mut rest).await;
        });

        let options = HandshakeOptions::default();
        let result = Handshake::new(&mut client, &endpoint, &options)
            .run(&example_ipv4())
            .await;
        assert!(matches!(result, Err(HandshakeError::AuthMethodRequired)));
    }

    #[tokio::test]
    async fn test_username_without_password_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let endpoint = UpstreamEndpoint::new("127.0.0.1", 1080).with_credentials("alice", None);

        let upstream = tokio::spawn(async move {
            expect(&mut server, &[0x05, 0x02, 0x00, 0x02]).await;
            server.write_all(&[0x05, 0x02]).await.unwrap();
            let mut rest = Vec::new();
            server.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let options = HandshakeOptions::default();
        let result = Handshake::new(&mut client, &endpoint, &options)
            .run(&example_ipv4())
            .await;
        drop(client);

        assert!(matches!(result, Err(HandshakeError::MalformedEndpoint)));
        assert!(upstream.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let endpoint = UpstreamEndpoint::new("127.0.0.1", 1080);

        tokio::spawn(async move {
            expect(&mut server, &[0x05, 0x02, 0x00, 0x02]).await;
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            // 只回两个字节就关闭
            server.write_all(&[0x05, 0x05]).await.unwrap();
        });

        let options = HandshakeOptions::default();
        let result = Handshake::new(&mut client, &endpoint, &options)
            .run(&example_ipv4())
            .await;
        match result {
            Err(e @ HandshakeError::ConnectionRefused(0x05)) => {
                assert!(e.to_string().contains("connection refused"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fragmented_replies() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let endpoint = UpstreamEndpoint::new("127.0.0.1", 1080);
        let target = TargetAddress::domain("example.com", 443).unwrap();

        let upstream = tokio::spawn(async move {
            expect(&mut server, &[0x05, 0x02, 0x00, 0x02]).await;
            server.write_all(&[0x05]).await.unwrap();
            tokio::task::yield_now().await;
            server.write_all(&[0x00]).await.unwrap();

            let mut request = [0u8; 3 + 1 + 1 + 11 + 2];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[3..5], &[0x03, 0x0B]);
            assert_eq!(&request[5..16], b"example.com");
            assert_eq!(&request[16..], &[0x01, 0xBB]);

            // IPv6 绑定地址分三段发送
            server.write_all(&[0x05, 0x00, 0x00]).await.unwrap();
            tokio::task::yield_now().await;
            server.write_all(&[0x04, 0, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();
            tokio::task::yield_now().await;
            server.write_all(&[0, 0, 0, 0, 0, 0, 0, 1, 0x00, 0x50]).await.unwrap();
            server.write_all(b"payload").await.unwrap();
        });

        let options = HandshakeOptions::default();
        Handshake::new(&mut client, &endpoint, &options)
            .run(&target)
            .await
            .unwrap();

        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");
        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_bound_address_type_is_not_fatal() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let endpoint = UpstreamEndpoint::new("127.0.0.1", 1080);

        let upstream = tokio::spawn(async move {
            let mut method = [0u8; 4];
            server.read_exact(&mut method).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            // 地址类型未知, 后面的字节无法判断长度
            server.write_all(&[0x05, 0x00, 0x00, 0x09, 0xAA, 0xBB]).await.unwrap();
            server
        });

        let options = HandshakeOptions {
            verbose: true,
            ..HandshakeOptions::default()
        };
        let result = Handshake::new(&mut client, &endpoint, &options)
            .run(&example_ipv4())
            .await;
        assert!(result.is_ok());

        // 只读到 RSV ATYP 为止, 剩余字节留在连接里
        let mut rest = [0u8; 2];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest, [0xAA, 0xBB]);
        drop(upstream.await.unwrap());
    }

    #[tokio::test]
    async fn test_upstream_closed_before_reply() {
        let (mut client, server) = tokio::io::duplex(1024);
        drop(server);

        let endpoint = UpstreamEndpoint::new("127.0.0.1", 1080);
        let options = HandshakeOptions::default();
        let result = Handshake::new(&mut client, &endpoint, &options)
            .run(&example_ipv4())
            .await;
        assert!(matches!(result, Err(HandshakeError::Io(_))));
    }

    #[tokio::test]
    async fn test_connect_dial_error() {
        // 绑定后立即释放, 端口上没有监听者
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = UpstreamEndpoint::new("127.0.0.1", port);
        let result = connect(&endpoint, &example_ipv4(), &HandshakeOptions::default()).await;
        assert!(matches!(result, Err(HandshakeError::Dial { .. })));
    }

    #[tokio::test]
    async fn test_connect_returns_stream_with_nodelay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut method = [0u8; 4];
            stream.read_exact(&mut method).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            stream.write_all(b"tunnel").await.unwrap();
        });

        let endpoint = UpstreamEndpoint::new("127.0.0.1", addr.port());
        let mut stream = connect(&endpoint, &example_ipv4(), &HandshakeOptions::default())
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());

        let mut data = [0u8; 6];
        stream.read_exact(&mut data).await.unwrap();
        assert_eq!(&data, b"tunnel");
    }

    #[tokio::test]
    async fn test_connect_handshake_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // 接受连接但从不回复
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let endpoint = UpstreamEndpoint::new("127.0.0.1", addr.port());
        let options = HandshakeOptions {
            handshake_timeout: Some(Duration::from_millis(100)),
            ..HandshakeOptions::default()
        };
        let result = connect(&endpoint, &example_ipv4(), &options).await;
        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
    }
}
