// 进程级可变状态与锁工具
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::value::ClassLoaderRef;

// Mutex/RwLock poison 恢复扩展，避免持锁线程 panic 后引发连锁 panic
pub(crate) trait MutexPoisonRecover<T> {
    fn lock_or_poison(&self) -> MutexGuard<'_, T>;
}

pub(crate) trait RwLockPoisonRecover<T> {
    fn read_or_poison(&self) -> RwLockReadGuard<'_, T>;
    fn write_or_poison(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> MutexPoisonRecover<T> for Mutex<T> {
    fn lock_or_poison(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> RwLockPoisonRecover<T> for RwLock<T> {
    fn read_or_poison(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_or_poison(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|e| e.into_inner())
    }
}

// 当前应用进程的上下文，fork 进入子进程时清空
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppContext {
    pub uid: i32,
    pub nice_name: String,
    pub app_data_dir: String,
    pub package_name: Option<String>,
    pub process_name: Option<String>,
    // 已派发过 PackageLoaded 的 (包名, 类加载器)，避免重复通知
    pub loaded_packages: Vec<(String, ClassLoaderRef)>,
    pub resources_packages: Vec<String>,
}

impl AppContext {
    // 返回 true 表示首次出现
    pub(crate) fn mark_package_loaded(&mut self, package: &str, loader: ClassLoaderRef) -> bool {
        if self
            .loaded_packages
            .iter()
            .any(|(name, l)| name == package && *l == loader)
        {
            return false;
        }
        self.loaded_packages.push((package.to_string(), loader));
        true
    }

    pub(crate) fn mark_resources_loaded(&mut self, package: &str) -> bool {
        if self.resources_packages.iter().any(|name| name == package) {
            return false;
        }
        self.resources_packages.push(package.to_string());
        true
    }
}
