use bytes::{BufMut, BytesMut};
use http::Uri;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

// ATYP(1B) | ADDR | PORT(2B 大端), 域名前带 1 字节长度
pub const IPV4_ADDRESS: u8 = 0x01;
pub const DOMAIN_NAME: u8 = 0x03;
pub const IPV6_ADDRESS: u8 = 0x04;

/// 域名长度字段只有一个字节
pub const MAX_DOMAIN_LEN: usize = 255;

/// CONNECT 请求未带端口时使用的默认端口
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("请求中没有目标主机")]
    MissingHost,
    #[error("域名为空")]
    EmptyDomain,
    #[error("域名长度 {0} 超过 255 字节")]
    DomainTooLong(usize),
    #[error("未知的地址类型: 0x{0:02x}")]
    UnknownAddressType(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

/// 隧道目标: 主机 + 端口, 构造后不再修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    host: Host,
    port: u16,
}

impl TargetAddress {
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        TargetAddress { host: Host::Ipv4(ip), port }
    }

    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Self {
        TargetAddress { host: Host::Ipv6(ip), port }
    }

    /// 域名目标, 超过 255 字节直接拒绝而不是截断
    pub fn domain(name: impl Into<String>, port: u16) -> Result<Self, AddressError> {
        let name = name.into();
        if name.is_empty() {
            return Err(AddressError::EmptyDomain);
        }
        if name.len() > MAX_DOMAIN_LEN {
            return Err(AddressError::DomainTooLong(name.len()));
        }
        Ok(TargetAddress { host: Host::Domain(name), port })
    }

    /// 按主机字符串选择地址类型: 能解析成 IP 的走 IPv4/IPv6, 否则按域名处理。
    /// IPv4 映射的 IPv6 地址按 IPv4 发送。
    pub fn from_host(host: &str, port: u16) -> Result<Self, AddressError> {
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        match bare.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Ok(Self::ipv4(ip, port)),
            Ok(IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(v4) => Ok(Self::ipv4(v4, port)),
                None => Ok(Self::ipv6(ip, port)),
            },
            Err(_) => Self::domain(bare, port),
        }
    }

    /// 从请求 URI 取目标; CONNECT 的 authority 形式和绝对 URI 都可以
    pub fn from_uri(uri: &Uri) -> Result<Self, AddressError> {
        let host = uri.host().ok_or(AddressError::MissingHost)?;
        let port = uri.port_u16().unwrap_or(DEFAULT_TUNNEL_PORT);
        Self::from_host(host, port)
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address_type(&self) -> u8 {
        match self.host {
            Host::Ipv4(_) => IPV4_ADDRESS,
            Host::Ipv6(_) => IPV6_ADDRESS,
            Host::Domain(_) => DOMAIN_NAME,
        }
    }

    /// 写入 ATYP + ADDR + PORT
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.address_type());
        match &self.host {
            Host::Ipv4(ip) => buf.put_slice(&ip.octets()),
            Host::Ipv6(ip) => buf.put_slice(&ip.octets()),
            Host::Domain(name) => {
                // 长度已在构造时检查
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
        }
        buf.put_u16(self.port);
    }

    /// 读取 ATYP 之后的地址和端口。
    /// 调用方已经读掉了 ATYP 字节, 未知类型时不消费任何数据。
    pub async fn read_from<R>(reader: &mut R, address_type: u8) -> std::io::Result<Result<Self, AddressError>>
    where
        R: AsyncRead + Unpin,
    {
        let host = match address_type {
            IPV4_ADDRESS => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                Host::Ipv4(Ipv4Addr::from(octets))
            }
            IPV6_ADDRESS => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                Host::Ipv6(Ipv6Addr::from(octets))
            }
            DOMAIN_NAME => {
                let len = reader.read_u8().await?;
                let mut name = vec![0u8; len as usize];
                reader.read_exact(&mut name).await?;
                Host::Domain(String::from_utf8_lossy(&name).into_owned())
            }
            other => return Ok(Err(AddressError::UnknownAddressType(other))),
        };
        let port = reader.read_u16().await?;
        Ok(Ok(TargetAddress { host, port }))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ipv4(ip) => write!(f, "{}", ip),
            Host::Ipv6(ip) => write!(f, "[{}]", ip),
            Host::Domain(name) => f.write_str(name),
        }
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
