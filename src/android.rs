// Android 平台相关功能的模块入口

// trampoline 页的保护切换与 icache 刷新
pub mod memory;
