// fork 生命周期：zygote 预处理、子进程状态重建、bootstrap hook 安装与模块加载
use crate::error::HookError;
use crate::log;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};

use super::Runtime;
use super::deopt::{DeoptReport, KEY_BOOT_IMAGE, KEY_BOOT_IMAGE_MIUI_RES, KEY_SYSTEM_SERVER};
use super::modules::LoadReport;
use super::state::{AppContext, MutexPoisonRecover};
use super::value::ClassLoaderRef;

pub(crate) mod bootstrap;

const SYSTEM_SERVER_NICE_NAME: &str = "system_server";
const SYSTEM_SERVER_DATA_DIR: &str = "/data/user/0/android";
const SYSTEM_UID: i32 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ForkPhase {
    Unforked = 0,
    Preparing = 1,
    BootstrapHooksInstalled = 2,
    ModulesLoaded = 3,
    ChildEntered = 4,
}

impl ForkPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Preparing,
            2 => Self::BootstrapHooksInstalled,
            3 => Self::ModulesLoaded,
            4 => Self::ChildEntered,
            _ => Self::Unforked,
        }
    }
}

// 应用进程 specialize 时传入的参数
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpecializeArgs {
    pub uid: i32,
    pub nice_name: String,
    pub app_data_dir: String,
    pub is_child_zygote: bool,
}

pub(crate) struct ForkState {
    phase: AtomicU8,
    is_system_server: AtomicBool,
    bootstrap_installed: AtomicBool,
    fork_completed: AtomicBool,
    // 以下字段不随 fork 重置
    modules_preloaded: AtomicBool,
    boot_image_deopted: AtomicBool,
    // 创建 Runtime 的进程，通常是 zygote
    owner_pid: AtomicI32,
    bootstrap_installs: AtomicUsize,
}

impl ForkState {
    pub(crate) fn new() -> Self {
        Self {
            phase: AtomicU8::new(ForkPhase::Unforked as u8),
            is_system_server: AtomicBool::new(false),
            bootstrap_installed: AtomicBool::new(false),
            fork_completed: AtomicBool::new(false),
            modules_preloaded: AtomicBool::new(false),
            boot_image_deopted: AtomicBool::new(false),
            owner_pid: AtomicI32::new(current_pid()),
            bootstrap_installs: AtomicUsize::new(0),
        }
    }

    pub(crate) fn phase(&self) -> ForkPhase {
        ForkPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: ForkPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    // 只前进不后退，竞争的入口不会把阶段改回去
    fn advance(&self, phase: ForkPhase) {
        self.phase.fetch_max(phase as u8, Ordering::AcqRel);
    }

    fn claim_bootstrap(&self) -> bool {
        self.bootstrap_installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn reset(&self) {
        self.set_phase(ForkPhase::Unforked);
        self.is_system_server.store(false, Ordering::Release);
        self.bootstrap_installed.store(false, Ordering::Release);
        self.fork_completed.store(false, Ordering::Release);
    }
}

fn current_pid() -> i32 {
    unsafe { libc::getpid() }
}

impl Runtime {
    pub fn fork_phase(&self) -> ForkPhase {
        self.fork.phase()
    }

    pub fn is_system_server(&self) -> bool {
        self.fork.is_system_server.load(Ordering::Acquire)
    }

    pub fn is_fork_completed(&self) -> bool {
        self.fork.fork_completed.load(Ordering::Acquire)
    }

    pub fn is_forked_child(&self) -> bool {
        self.fork.owner_pid.load(Ordering::Acquire) != current_pid()
    }

    pub fn bootstrap_install_count(&self) -> usize {
        self.fork.bootstrap_installs.load(Ordering::Acquire)
    }

    pub fn prepare(&self, is_system_server: bool) {
        self.fork
            .is_system_server
            .store(is_system_server, Ordering::Release);
        self.fork.advance(ForkPhase::Preparing);
        log::debug(format_args!("prepare fork, system_server={is_system_server}"));
    }

    // 多个入口并发调用时只有一个会真正安装；返回是否由本次调用安装
    pub fn install_bootstrap_hooks(&self) -> Result<bool, HookError> {
        if !self.fork.claim_bootstrap() {
            return Ok(false);
        }
        self.fork.bootstrap_installs.fetch_add(1, Ordering::AcqRel);
        match bootstrap::install(self, self.is_system_server()) {
            Ok(count) => {
                log::info(format_args!("installed {count} bootstrap hooks"));
                self.fork.advance(ForkPhase::BootstrapHooksInstalled);
                Ok(true)
            }
            Err(err) => {
                log::error(format_args!("bootstrap hooks failed: {err}, hooks disabled"));
                if matches!(err, HookError::IncompatibleVm(_)) {
                    self.disable_hooks();
                    self.reset_hooks();
                }
                Err(err)
            }
        }
    }

    // 非动态模式下只在首次调用时加载，之后的子进程沿用 zygote 中的模块
    pub fn load_modules(&self) -> LoadReport {
        let dynamic = self.config.dynamic_modules;
        let report = if !dynamic && self.fork.modules_preloaded.swap(true, Ordering::AcqRel) {
            LoadReport::default()
        } else {
            let report = self.modules.load(dynamic);
            log::info(format_args!(
                "modules loaded {} failed {}",
                report.loaded, report.failed
            ));
            report
        };
        self.fork.advance(ForkPhase::ModulesLoaded);
        report
    }

    // 子进程继承了 zygote 的全部状态，这里清理 hook 记录与应用上下文
    pub fn enter_child(&self) {
        self.fork.reset();
        let cleared = self.reset_hooks();
        *self.app.lock_or_poison() = AppContext::default();
        if self.config.dynamic_modules {
            self.modules.reset();
        }
        log::debug(format_args!("entered child, cleared {cleared} hooks"));
    }

    pub fn fork_finished(&self) {
        self.fork.fork_completed.store(true, Ordering::Release);
        self.fork.set_phase(ForkPhase::ChildEntered);
    }

    pub fn deopt_boot_image(&self) -> DeoptReport {
        let bridge = self.bridge();
        let mut report = self
            .deopter
            .deopt(bridge, KEY_BOOT_IMAGE, ClassLoaderRef::BOOT);
        let miui = self
            .deopter
            .deopt(bridge, KEY_BOOT_IMAGE_MIUI_RES, ClassLoaderRef::BOOT);
        report.deoptimized += miui.deoptimized;
        report.skipped += miui.skipped;
        report.missing += miui.missing;
        report.failed += miui.failed;
        report
    }

    fn deopt_boot_image_once(&self) {
        if !self.config.deopt_boot_image
            || self.fork.boot_image_deopted.swap(true, Ordering::AcqRel)
        {
            return;
        }
        self.deopt_boot_image();
    }

    fn on_fork_pre(&self, is_system_server: bool) {
        self.fork.fork_completed.store(false, Ordering::Release);
        self.fork.set_phase(ForkPhase::Unforked);
        self.prepare(is_system_server);
        if !self.config.dynamic_modules {
            self.deopt_boot_image_once();
        }
        self.load_modules();
    }

    fn on_fork_post(&self, is_system_server: bool, args: &SpecializeArgs) {
        self.enter_child();
        {
            let mut app = self.app.lock_or_poison();
            app.uid = args.uid;
            app.app_data_dir = args.app_data_dir.clone();
            app.nice_name = args.nice_name.clone();
        }
        if !self.needs_hook(&args.app_data_dir, &args.nice_name) {
            self.fork_finished();
            return;
        }

        self.prepare(is_system_server);
        self.deopt_boot_image_once();
        if is_system_server {
            self.deopter
                .deopt(self.bridge(), KEY_SYSTEM_SERVER, ClassLoaderRef::BOOT);
        }
        if let Err(err) = self.install_bootstrap_hooks() {
            log::warn(format_args!("{}: {err}", args.nice_name));
        }
        // 动态模式在子进程中重新读取模块列表
        self.load_modules();
        self.modules.dispatch_zygote_init(self, is_system_server);
        self.fork_finished();
    }

    fn needs_hook(&self, app_data_dir: &str, nice_name: &str) -> bool {
        if app_data_dir.is_empty() {
            log::warn(format_args!("{nice_name}: no app data dir, skipped"));
            return false;
        }
        if self.config.is_denied(nice_name) {
            log::info(format_args!("{nice_name}: denied by config"));
            return false;
        }
        true
    }

    pub fn on_fork_and_specialize_pre(&self, args: &SpecializeArgs) {
        log::debug(format_args!("specialize pre {} uid {}", args.nice_name, args.uid));
        self.on_fork_pre(false);
    }

    pub fn on_fork_and_specialize_post(&self, args: &SpecializeArgs) {
        self.on_fork_post(false, args);
    }

    pub fn on_fork_system_server_pre(&self) {
        self.on_fork_pre(true);
    }

    pub fn on_fork_system_server_post(&self) {
        let args = SpecializeArgs {
            uid: SYSTEM_UID,
            nice_name: SYSTEM_SERVER_NICE_NAME.to_string(),
            app_data_dir: SYSTEM_SERVER_DATA_DIR.to_string(),
            is_child_zygote: false,
        };
        self.on_fork_post(true, &args);
    }
}
