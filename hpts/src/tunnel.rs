use hyper::ext::ReasonPhrase;
use hyper::{Response, StatusCode};
use log::debug;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

/// 接管连接前发给客户端的状态行: `HTTP/1.1 200 Connection Established`
pub const ESTABLISHED_REASON: &[u8] = b"Connection Established";

/// 构造 CONNECT 成功响应, body 应为空
pub fn established<B>(body: B) -> Response<B> {
    let mut resp = Response::new(body);
    *resp.status_mut() = StatusCode::OK;
    resp.extensions_mut()
        .insert(ReasonPhrase::from_static(ESTABLISHED_REASON));
    resp
}

/// 单个方向的结果
#[derive(Debug)]
pub enum Leg {
    Done(u64),
    Failed(io::Error),
    /// 另一方向先结束, 本方向被取消
    Cancelled,
}

impl Leg {
    pub fn bytes(&self) -> Option<u64> {
        match self {
            Leg::Done(n) => Some(*n),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct RelayReport {
    pub client_to_upstream: Leg,
    pub upstream_to_client: Leg,
}

/// 在客户端连接和上游连接之间转发数据, 直到任一方向结束
pub async fn relay<C, U>(client: C, upstream: U) -> RelayReport
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let mut uplink = tokio::spawn(pipe(client_read, upstream_write));
    let mut downlink = tokio::spawn(pipe(upstream_read, client_write));

    tokio::select! {
        result = &mut uplink => {
            debug!("客户端到上游的数据传输完成");
            let client_to_upstream = finished(result);
            let upstream_to_client = cancel(downlink).await;
            RelayReport { client_to_upstream, upstream_to_client }
        }
        result = &mut downlink => {
            debug!("上游到客户端的数据传输完成");
            let upstream_to_client = finished(result);
            let client_to_upstream = cancel(uplink).await;
            RelayReport { client_to_upstream, upstream_to_client }
        }
    }
}

/// 复制到 EOF 或出错, 然后关闭目标写端。
/// 任务结束时两个半边都被释放。
async fn pipe<R, W>(mut src: ReadHalf<R>, mut dst: WriteHalf<W>) -> io::Result<u64>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let result = tokio::io::copy(&mut src, &mut dst).await;
    let _ = dst.shutdown().await;
    result
}

fn finished(result: Result<io::Result<u64>, tokio::task::JoinError>) -> Leg {
    match result {
        Ok(Ok(n)) => Leg::Done(n),
        Ok(Err(e)) => Leg::Failed(e),
        Err(e) => Leg::Failed(io::Error::other(e)),
    }
}

/// 取消另一方向并等它真正退出, 这样它持有的半边也已释放
async fn cancel(handle: JoinHandle<io::Result<u64>>) -> Leg {
    handle.abort();
    match handle.await {
        Ok(result) => finished(Ok(result)),
        Err(e) if e.is_cancelled() => Leg::Cancelled,
        Err(e) => Leg::Failed(io::Error::other(e)),
    }
}
