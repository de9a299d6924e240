use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// MainMemory: a per-core cooperative runtime hosting a memcache-compatible
/// in-memory key/value server.
#[derive(Debug, Parser)]
#[command(name = "mmd", version, about)]
pub struct Cmdline {
    /// Worker threads, one per core. Defaults to the detected CPU count.
    #[arg(long, env = "MM_CORES")]
    pub cores: Option<usize>,

    /// Worker-task cap per core.
    #[arg(long, default_value_t = 256)]
    pub max_workers: usize,

    /// Table partitions (rounded up to a power of two). Defaults to the
    /// core count.
    #[arg(long)]
    pub partitions: Option<usize>,

    /// Byte budget per partition; crossing it starts eviction.
    #[arg(long, default_value_t = 64 << 20)]
    pub volume: usize,

    /// Partition serialization strategy.
    #[arg(long, value_enum, default_value_t = StrategyArg::Lock)]
    pub strategy: StrategyArg,

    /// TCP listen address for the memcache protocol.
    #[arg(long, default_value = "127.0.0.1:11211")]
    pub listen: String,

    /// Unix socket path for the stub command channel.
    #[arg(long, default_value = "mm_cmd.sock")]
    pub cmd_sock: PathBuf,

    /// Log filter when RUST_LOG is unset (tracing EnvFilter syntax).
    #[arg(long, default_value = "info")]
    pub log: String,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
pub enum StrategyArg {
    /// Spin task-lock per partition.
    Lock,
    /// Delegate actions to the partition's owning core.
    Delegate,
    /// Flat combining per partition.
    Combine,
}

impl From<StrategyArg> for mm_store::Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Lock => mm_store::Strategy::Lock,
            StrategyArg::Delegate => mm_store::Strategy::Delegate,
            StrategyArg::Combine => mm_store::Strategy::Combine,
        }
    }
}
