use crate::router::Router;
use anyhow::Result;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use tokio::net::{TcpListener, TcpStream};

/// 接受连接, 每个连接一个任务, 直到监听出错
pub async fn serve(listener: TcpListener, router: Router) -> Result<()> {
    info!("HTTP 代理监听在 {}", listener.local_addr()?);
    info!("上游 SOCKS5 服务器: {}", router.config().upstream);

    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                if router.config().verbose {
                    debug!("新连接来自: {}", addr);
                }
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(socket, router).await {
                        debug!("连接 {} 结束: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("接受连接时出错: {}", e);
            }
        }
    }
}

async fn serve_connection(socket: TcpStream, router: Router) -> Result<()> {
    let io = TokioIo::new(socket);
    let service = service_fn(move |req| {
        let router = router.clone();
        async move { router.handle(req).await }
    });

    // CONNECT 的成功响应只能是状态行加空行
    http1::Builder::new()
        .auto_date_header(false)
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await?;
    Ok(())
}
