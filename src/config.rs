// 运行时配置，可由环境变量覆盖
use crate::log;
use regex::Regex;
use std::env;

pub const ENV_BACKEND: &str = "LSPHOOK_BACKEND";
pub const ENV_DEBUG: &str = "LSPHOOK_DEBUG";
pub const ENV_DYNAMIC_MODULES: &str = "LSPHOOK_DYNAMIC_MODULES";
pub const ENV_RECORDS: &str = "LSPHOOK_RECORDS";
pub const ENV_DENYLIST: &str = "LSPHOOK_DENYLIST";
pub const ENV_DEOPT_BOOT_IMAGE: &str = "LSPHOOK_DEOPT_BOOT_IMAGE";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendPreference {
    #[default]
    Auto,
    DirectPatch,
    DynamicProxy,
}

impl BackendPreference {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Some(Self::Auto),
            "direct" | "direct_patch" | "yahfa" => Some(Self::DirectPatch),
            "proxy" | "dynamic_proxy" | "dexmaker" => Some(Self::DynamicProxy),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub backend: BackendPreference,
    pub debug: bool,
    // true 时每个子进程重新读取模块列表，否则沿用 zygote 中读取的列表
    pub dynamic_modules: bool,
    pub recordable: bool,
    pub deopt_boot_image: bool,
    // 匹配进程名的正则，命中则跳过该进程
    pub deny_processes: Vec<Regex>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            debug: false,
            dynamic_modules: false,
            recordable: false,
            deopt_boot_image: true,
            deny_processes: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    // 解析失败的值记录警告后保持默认
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_BACKEND) {
            match BackendPreference::parse(&value) {
                Some(backend) => config.backend = backend,
                None => log::warn(format_args!("ignore {ENV_BACKEND}={value}")),
            }
        }
        config.debug = flag(&lookup, ENV_DEBUG, config.debug);
        config.dynamic_modules = flag(&lookup, ENV_DYNAMIC_MODULES, config.dynamic_modules);
        config.recordable = flag(&lookup, ENV_RECORDS, config.recordable);
        config.deopt_boot_image = flag(&lookup, ENV_DEOPT_BOOT_IMAGE, config.deopt_boot_image);
        if let Some(value) = lookup(ENV_DENYLIST) {
            config.deny_processes = parse_patterns(&value);
        }
        config
    }

    pub fn is_denied(&self, process_name: &str) -> bool {
        self.deny_processes
            .iter()
            .any(|pattern| pattern.is_match(process_name))
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    match lookup(name) {
        Some(value) => parse_bool_env_value(&value).unwrap_or_else(|| {
            log::warn(format_args!("ignore {name}={value}"));
            default
        }),
        None => default,
    }
}

pub(crate) fn parse_bool_env_value(value: &str) -> Option<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// 逗号分隔，非法正则跳过
fn parse_patterns(value: &str) -> Vec<Regex> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty())
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(err) => {
                log::warn(format_args!("bad deny pattern {pattern}: {err}"));
                None
            }
        })
        .collect()
}
