use std::future::Future;

use tokio::signal::unix;

pub const TERMINATION_SIGNALS: [libc::c_int; 5] = [
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGQUIT,
    libc::SIGABRT,
    20, // SIGTSTP
];

/// Subscribes to all `signals` and resolves with the first one received.
///
/// Subscriptions are made eagerly so a failure surfaces before the service starts.
pub fn any_signal<I, T>(signals: I) -> std::io::Result<impl Future<Output = unix::SignalKind>>
where
    I: IntoIterator<Item = T>,
    T: Into<unix::SignalKind>,
{
    let streams = signals
        .into_iter()
        .map(|signal| {
            let kind = signal.into();
            unix::signal(kind).map(|stream| (kind, stream))
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    Ok(async move {
        let received = streams.into_iter().map(|(kind, mut stream)| {
            Box::pin(async move {
                stream.recv().await;
                kind
            })
        });
        futures_util::future::select_all(received).await.0
    })
}
