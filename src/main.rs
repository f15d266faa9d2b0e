use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use router::EventRouter;
use server_inner::ServerInner;
use supervisor::Supervisor;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tonic::transport::Server;
use transcoder::TranscoderCommand;

pub mod service {
    tonic::include_proto!("transcoder");
}

mod config;
mod error;
mod platform;
mod profile;
mod router;
mod server_inner;
mod session;
mod supervisor;
#[cfg(test)]
mod testing;
mod transcoder;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How long open connections get to finish after the transcoders are gone.
const SERVER_DRAIN: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();
    env_logger::init();

    let config = config::Config::from_env()?;
    log::info!(
        "listening on {}, transcoder {}, grace period {:?}",
        config.listen_addr,
        config.ffmpeg_path.display(),
        config.grace_period
    );

    let router = Arc::new(EventRouter::new(
        Supervisor::new(config.grace_period),
        TranscoderCommand::ffmpeg(&config.ffmpeg_path),
    ));
    let server = ServerInner::new(router.clone());

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut serve = tokio::spawn(
        Server::builder()
            .add_service(service::transcoder_server::TranscoderServer::new(server))
            .serve_with_shutdown(config.listen_addr, async move {
                let _ = stop_rx.await;
            }),
    );

    tokio::select! {
        result = shutdown_signal() => result?,
        result = &mut serve => {
            log::error!("server stopped unexpectedly");
            router.on_process_shutdown().await;
            return result?.map_err(Into::into);
        }
    }

    router.on_process_shutdown().await;
    let _ = stop_tx.send(());

    match tokio::time::timeout(SERVER_DRAIN, serve).await {
        Ok(result) => result??,
        Err(_) => log::warn!("connections still open after {:?}, exiting", SERVER_DRAIN),
    }
    log::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> Result<(), BoxError> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    log::info!("shutdown signal received");
    Ok(())
}
