use serde::Serialize;

/// Machine snapshot reported to the dispatcher in `status` frames.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct HostStatus {
    pub mid: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub cpu: String,
    pub cores: usize,
    /// Bytes.
    pub memory_total: u64,
    pub memory_available: u64,
    pub load: [f64; 3],
    pub version: String,
    pub concurrency: usize,
}

impl HostStatus {
    pub fn collect(concurrency: usize) -> Self {
        let hostname = hostname();
        let mid = std::fs::read_to_string("/etc/machine-id")
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| hostname.clone());
        let (memory_total, memory_available) = std::fs::read_to_string("/proc/meminfo")
            .map(|s| parse_meminfo(&s))
            .unwrap_or_default();
        let load = std::fs::read_to_string("/proc/loadavg")
            .map(|s| parse_loadavg(&s))
            .unwrap_or_default();
        let cpu = std::fs::read_to_string("/proc/cpuinfo")
            .ok()
            .and_then(|s| parse_cpu_model(&s))
            .unwrap_or_default();
        Self {
            mid,
            hostname,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu,
            cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            memory_total,
            memory_available,
            load,
            version: env!("CARGO_PKG_VERSION").to_string(),
            concurrency,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `(MemTotal, MemAvailable)` in bytes.
fn parse_meminfo(raw: &str) -> (u64, u64) {
    let field = |name: &str| {
        raw.lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .and_then(|rest| rest.split_whitespace().next()?.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    };
    (field("MemTotal"), field("MemAvailable"))
}

fn parse_loadavg(raw: &str) -> [f64; 3] {
    let mut load = [0.0; 3];
    for (slot, value) in load.iter_mut().zip(raw.split_whitespace()) {
        *slot = value.parse().unwrap_or(0.0);
    }
    load
}

fn parse_cpu_model(raw: &str) -> Option<String> {
    raw.lines()
        .find(|line| line.starts_with("model name"))
        .and_then(|line| line.split_once(':'))
        .map(|(_, model)| model.trim().to_string())
}
