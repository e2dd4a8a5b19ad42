// 日志输出，经 log 门面转发；Android 上由 android_logger 写入 logcat
use std::fmt;

pub const LOG_TAG: &str = "LSPosed-Bridge";
const LOG_TARGET: &str = "lsphook";

// 安装平台 logger，重复调用无副作用
pub fn init_platform_logger(debug: bool) {
    #[cfg(target_os = "android")]
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(level_for(debug))
            .with_tag(LOG_TAG),
    );
    set_debug_enabled(debug);
}

fn level_for(debug: bool) -> ::log::LevelFilter {
    if debug {
        ::log::LevelFilter::Debug
    } else {
        ::log::LevelFilter::Warn
    }
}

// 启用时输出 DEBUG 及以上，禁用时仅输出 WARN 及以上
pub fn set_debug_enabled(enabled: bool) {
    ::log::set_max_level(level_for(enabled));
}

pub fn debug_enabled() -> bool {
    ::log::max_level() >= ::log::LevelFilter::Debug
}

fn write_log(level: ::log::Level, args: fmt::Arguments) {
    ::log::log!(target: LOG_TARGET, level, "{args}");
}

pub(crate) fn info(args: fmt::Arguments) {
    write_log(::log::Level::Info, args);
}

pub(crate) fn debug(args: fmt::Arguments) {
    write_log(::log::Level::Debug, args);
}

pub(crate) fn warn(args: fmt::Arguments) {
    write_log(::log::Level::Warn, args);
}

pub(crate) fn error(args: fmt::Arguments) {
    write_log(::log::Level::Error, args);
}
