use crate::address::{AddressError, TargetAddress};
use crate::config::Config;
use crate::forward::Forwarder;
use crate::socks5::{self, HandshakeError, HandshakeOptions};
use crate::tunnel;
use bytes::Bytes;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Body;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use log::{error, info, warn};
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Forward,
    Tunnel,
}

impl Route {
    // http 交给转发客户端, 其它一律走隧道
    pub fn classify(uri: &Uri) -> Route {
        if uri.scheme_str() == Some("http") {
            Route::Forward
        } else {
            Route::Tunnel
        }
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Hijacking not supported")]
    HijackUnsupported,
    #[error("无效的目标地址: {0}")]
    Target(#[from] AddressError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("转发请求失败: {0}")]
    Forward(#[from] reqwest::Error),
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::HijackUnsupported => StatusCode::SERVICE_UNAVAILABLE,
            RouteError::Target(_) => StatusCode::BAD_REQUEST,
            RouteError::Handshake(_) | RouteError::Forward(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_response(self) -> Response<ProxyBody> {
        let mut resp = Response::new(full(format!("{}\n", self)));
        *resp.status_mut() = self.status();
        resp.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        resp
    }
}

/// 单个请求的上下文, 只在本请求内使用
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: Uuid,
    pub target: String,
    pub verbose: bool,
}

impl RequestContext {
    pub fn new<B>(req: &Request<B>, verbose: bool) -> Self {
        let target = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .or_else(|| {
                req.headers()
                    .get(http::header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        RequestContext {
            id: Uuid::new_v4(),
            target,
            verbose,
        }
    }
}

/// 所有请求共享的只读状态
#[derive(Debug, Clone)]
pub struct Router {
    config: Arc<Config>,
    forwarder: Forwarder,
}

impl Router {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let forwarder = Forwarder::new(&config)?;
        Ok(Router { config, forwarder })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, Infallible>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let ctx = RequestContext::new(&req, self.config.verbose);
        let route = Route::classify(req.uri());
        if ctx.verbose {
            info!("[{}] 新的 {:?} 请求 {} {}", ctx.id, route, req.method(), ctx.target);
        }

        let result = match route {
            Route::Forward => self.forward(req, &ctx).await,
            Route::Tunnel => self.tunnel(req, &ctx).await,
        };

        Ok(result.unwrap_or_else(|e| {
            error!("[{}] 处理请求 {} 时出错: {}", ctx.id, ctx.target, e);
            e.into_response()
        }))
    }

    async fn forward<B>(&self, req: Request<B>, ctx: &RequestContext) -> Result<Response<ProxyBody>, RouteError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let resp = self.forwarder.forward(req).await?;
        if ctx.verbose {
            info!("[{}] {} 返回 {}", ctx.id, ctx.target, resp.status());
        }
        Ok(resp)
    }

    /// 先确认能接管连接, 再握手, 最后返回 200 并在后台转发
    async fn tunnel<B>(&self, mut req: Request<B>, ctx: &RequestContext) -> Result<Response<ProxyBody>, RouteError> {
        let on_upgrade = req
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(RouteError::HijackUnsupported)?;

        let target = TargetAddress::from_uri(req.uri())?;
        let options = HandshakeOptions {
            dial_timeout: self.config.dial_timeout,
            handshake_timeout: self.config.handshake_timeout,
            verbose: self.config.verbose,
        };
        let upstream = socks5::connect(&self.config.upstream, &target, &options).await?;
        if ctx.verbose {
            info!("[{}] 经 {} 建立到 {} 的隧道", ctx.id, self.config.upstream, target);
        }

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let client = match on_upgrade.await {
                Ok(upgraded) => TokioIo::new(upgraded),
                Err(e) => {
                    // 已经回了 200, 只能关闭上游
                    warn!("[{}] 接管连接 {} 失败: {}", ctx.id, ctx.target, e);
                    return;
                }
            };

            let report = tunnel::relay(client, upstream).await;
            if ctx.verbose {
                info!(
                    "[{}] 隧道 {} 关闭, 上行 {:?}, 下行 {:?}",
                    ctx.id, ctx.target, report.client_to_upstream, report.upstream_to_client
                );
            }
        });

        Ok(tunnel::established(empty()))
    }
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}
