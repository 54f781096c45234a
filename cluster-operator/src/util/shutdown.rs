use owo_colors::OwoColorize;

use super::colors::FG2;

/// Resolves once SIGINT or SIGTERM (the signal a Kubernetes `Pod` termination
/// sends) is received.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => eprintln!("{}", "received SIGINT".color(FG2)),
            _ = sigterm.recv() => eprintln!("{}", "received SIGTERM".color(FG2)),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("install Ctrl+C handler");
    }
}
