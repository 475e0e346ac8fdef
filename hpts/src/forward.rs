use crate::config::Config;
use crate::router::{BoxError, ProxyBody};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{self, HeaderMap, HeaderName};
use http::{Request, Response};
use http_body_util::{BodyDataStream, BodyExt, StreamBody};
use hyper::body::{Body, Frame};

/// 逐跳头, 两个方向都不转发
static HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let proxy = reqwest::Proxy::all(config.upstream.proxy_url()?)?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .connect_timeout(config.dial_timeout)
            .tcp_keepalive(config.keep_alive)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Forwarder { client })
    }

    pub async fn forward<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, reqwest::Error>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        let body = reqwest::Body::wrap_stream(BodyDataStream::new(body).map_err(Into::<BoxError>::into));
        let upstream = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let mut resp = Response::builder().status(upstream.status());
        if let Some(resp_headers) = resp.headers_mut() {
            for (name, value) in upstream.headers() {
                if !is_hop_by_hop(name) {
                    resp_headers.append(name.clone(), value.clone());
                }
            }
        }

        let stream = upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError);
        let body = StreamBody::new(stream).boxed_unsync();

        // 状态码和头都来自合法的响应, 这里不会失败
        Ok(resp.body(body).unwrap_or_else(|_| Response::new(crate::router::empty())))
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Connection 头里列出的字段也是逐跳的
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}
