//! Loopback TCP establishment.
//!
//! Workers listen on 127.0.0.1 only; a stub that starts before its worker
//! retries the connect with bounded exponential backoff until the
//! configured wall-clock deadline passes.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio::time::sleep_until;
use tracing::debug;
use tracing::trace;

use crate::error::RelayErr;
use crate::error::Result;

const INITIAL_BACKOFF: Duration = Duration::from_millis(16);
const MAX_BACKOFF: Duration = Duration::from_millis(1000);

/// Binds a loopback listener on `port` (0 picks an ephemeral port).
pub async fn listen(port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
    debug!("listening on 127.0.0.1:{}", listener.local_addr()?.port());
    Ok(listener)
}

/// Connects to the loopback `port`, retrying with exponential backoff
/// (doubling, capped at one second) until `timeout_ms` of wall-clock time
/// has elapsed. A negative timeout retries forever. The backoff sleep never
/// overshoots the deadline.
pub async fn connect_with_backoff(port: u16, timeout_ms: i64) -> Result<TcpStream> {
    let deadline = u64::try_from(timeout_ms)
        .ok()
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!("connected to 127.0.0.1:{port}");
                return Ok(stream);
            }
            Err(err) => trace!("connect to port {port} failed: {err}"),
        }

        let now = Instant::now();
        if let Some(deadline) = deadline
            && now >= deadline
        {
            return Err(RelayErr::ConnectTimeout { port, timeout_ms });
        }

        backoff = (backoff * 2).min(MAX_BACKOFF);
        let mut wake = now + backoff;
        if let Some(deadline) = deadline {
            wake = wake.min(deadline);
        }
        sleep_until(wake).await;
    }
}
