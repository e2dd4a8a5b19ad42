const VERSION_STR: &str = env!("CARGO_PKG_VERSION");

#[cfg(target_arch = "aarch64")]
const VERSION_ARCH: &str = "aarch64";
#[cfg(target_arch = "x86_64")]
const VERSION_ARCH: &str = "x86_64";
#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
const VERSION_ARCH: &str = "unknown";

// major << 16 | minor << 8 | patch
pub fn version() -> u32 {
    let normalized = VERSION_STR.split(['-', '+']).next().unwrap_or(VERSION_STR);
    let mut parts = normalized.split('.');

    let major = parse_part(parts.next());
    let minor = parse_part(parts.next());
    let patch = parse_part(parts.next());

    (major << 16) | (minor << 8) | patch
}

pub fn version_str() -> &'static str {
    VERSION_STR
}

pub fn version_str_full() -> String {
    format!("lsphook {} ({}, {})", version_str(), VERSION_ARCH, build_flavor())
}

fn build_flavor() -> &'static str {
    if cfg!(feature = "simulator") || cfg!(test) {
        "simulator"
    } else {
        "device"
    }
}

fn parse_part(part: Option<&str>) -> u32 {
    part.and_then(|value| value.parse::<u32>().ok()).unwrap_or(0)
}
