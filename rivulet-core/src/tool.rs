use log::{error, info};
use std::{io::Write, sync::Once};

use tokio::signal::unix::{signal, SignalKind};

/// Partition key used when a record carries no owner id.
pub const DEFAULT_PARTITION_KEY: &str = "default";

/// Number of leading characters of the owner id used as partition key.
pub const PARTITION_KEY_LEN: usize = 10;

/// Init log. Set log format.
pub fn init_log() {
    env_logger::builder()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}:{} - {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .init();
}

static INIT_LOG: Once = Once::new();

/// Setup.
pub fn setup_log() {
    INIT_LOG.call_once(|| {
        init_log();
    });
}

/// Log the message at error level, then return it as an `anyhow` error.
#[macro_export]
macro_rules! error_bail {
    ($msg:literal $(,)?) => {
        log::error!($msg);
        anyhow::bail!($msg)
    };
    ($err:expr $(,)?) => {
        log::error!("{}", $err);
        anyhow::bail!($err)
    };
    ($fmt:expr, $($arg:tt)*) => {
        log::error!($fmt, $($arg)*);
        anyhow::bail!($fmt, $($arg)*)
    };
}

/// Derive the partition key of a record from its owner id.
///
/// Records of the same owner always get the same key, so they land in the same partition
/// and keep their relative order.
pub fn partition_key(owner_id: &str) -> String {
    if owner_id.is_empty() {
        return DEFAULT_PARTITION_KEY.to_string();
    }

    owner_id.chars().take(PARTITION_KEY_LEN).collect()
}

async fn wait_for_signal_impl() {
    // Infos here:
    // https://www.gnu.org/software/libc/manual/html_node/Termination-Signals.html
    let (mut signal_terminate, mut signal_interrupt) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(t), Ok(i)) => (t, i),
            (t, i) => {
                error!(
                    "install signal handlers failed, fallback to ctrl_c, terminate ok: {}, interrupt ok: {}",
                    t.is_ok(),
                    i.is_ok()
                );

                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("wait for ctrl_c failed, error: {}", e);
                }
                return;
            }
        };

    tokio::select! {
        _ = signal_terminate.recv() => {
            info!("Received SIGTERM.");
        }
        _ = signal_interrupt.recv() => {
            info!("Received SIGINT.");
        }
    };
}

pub async fn wait_for_signal() {
    wait_for_signal_impl().await
}
