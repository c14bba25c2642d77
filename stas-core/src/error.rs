use snafu::Snafu;

/// Errors raised while loading or interpreting the daemon configuration file
/// and the associated system identity file.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum ConfigError {
    #[snafu(display("Failed to read config file {}: {}", path, source))]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to parse config file {}: {}", path, source))]
    Parse {
        path: String,
        source: ini::Error,
    },
    #[snafu(display("Failed to read identity file {}: {}", path, source))]
    ReadIdentity {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Invalid value for [{}] {} = {:?}", section, option, value))]
    InvalidValue {
        section: String,
        option: String,
        value: String,
    },
}

/// Errors raised by the kernel fabric binding (the `/dev/nvme-fabrics`
/// control file and NVMe admin-command ioctls).
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum FabricError {
    #[snafu(display("Failed to open {}: {}", path, source))]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Connect request failed: {}", source))]
    Connect { source: std::io::Error },
    #[snafu(display("Discovery log page request failed for {}: {}", device, source))]
    GetLogPage {
        device: String,
        source: std::io::Error,
    },
    #[snafu(display("Malformed discovery log page entry at offset {}", offset))]
    MalformedLogPage { offset: usize },
    #[snafu(display("Disconnect failed for {}: {}", device, source))]
    Disconnect {
        device: String,
        source: std::io::Error,
    },
    #[snafu(display("nvme-fabrics kernel module not loaded (missing /dev/nvme-fabrics)"))]
    ModuleNotLoaded,
}

/// Errors raised while talking to udev (enumeration and live monitoring).
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum UdevError {
    #[snafu(display("Failed to create udev context: {}", source))]
    Context { source: std::io::Error },
    #[snafu(display("Failed to enumerate nvme devices: {}", source))]
    Enumerate { source: std::io::Error },
    #[snafu(display("Failed to start udev monitor: {}", source))]
    Monitor { source: std::io::Error },
}

/// Errors raised by the last-known-configuration snapshot store.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum LkcError {
    #[snafu(display("Failed to write LKC file {}: {}", path, source))]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to read LKC file {}: {}", path, source))]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to decode LKC file {}: {}", path, source))]
    Decode {
        path: String,
        source: bincode::Error,
    },
    #[snafu(display("Failed to encode LKC snapshot: {}", source))]
    Encode { source: bincode::Error },
}

/// Errors raised while parsing ACPI NBFT firmware tables.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum NbftError {
    #[snafu(display("Failed to read NBFT table {}: {}", path, source))]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("NBFT table {} truncated at offset {}", path, offset))]
    Truncated { path: String, offset: usize },
    #[snafu(display("NBFT table {} has bad signature {:?}", path, signature))]
    BadSignature { path: String, signature: [u8; 4] },
}

/// Errors raised by the local IPC server (the Unix-domain-socket status/
/// control surface).
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum IpcError {
    #[snafu(display("Failed to bind IPC socket {}: {}", path, source))]
    Bind {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to connect to IPC socket {}: {}", path, source))]
    ClientConnect {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("IPC client request failed: {}", source))]
    ClientIo { source: std::io::Error },
    #[snafu(display("IPC client got a malformed response: {}", source))]
    ClientDecode { source: serde_json::Error },
    #[snafu(display("IPC request malformed: {}", source))]
    Malformed { source: serde_json::Error },
    #[snafu(display("Unknown IPC method {:?}", method))]
    UnknownMethod { method: String },
}
