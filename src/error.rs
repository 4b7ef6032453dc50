#[derive(Debug, thiserror::Error)]
pub enum TracerError {
    #[error("kernel {0}.{1} not supported, require Linux 4.14+")]
    KernelNotSupported(u32, u32),
    #[error("cannot read kernel version")]
    KernelVersionUnknown,
    #[error("eBPF object load error: {0}")]
    Load(String),
    #[error("program {name}: {reason}")]
    Program { name: String, reason: String },
    #[error("map {name}: {reason}")]
    Map { name: String, reason: String },
    #[error("perf channel error: {0}")]
    Perf(String),
    #[error("offset inference: {0}")]
    OffsetInfer(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid state transition: {0}")]
    InvalidState(&'static str),
    #[error("spawn thread: {0}")]
    Thread(#[source] std::io::Error),
}
