// 直接改写目标 ArtMethod：变为 native，JNI 函数指向 trampoline，入口交给通用 JNI 跳板
use crate::error::HookError;
use crate::log;

use super::{
    ANDROID_MAX_SUPPORTED, ANDROID_O, Installed, VmBridge, discard_backup, mark_native,
    mark_non_compilable, prepare_backup,
};
use crate::runtime::descriptor::ResolvedMethod;
use crate::runtime::registry::{HookRecord, UnhookOutcome};

pub(crate) struct DirectPatch {
    sdk: i32,
}

impl DirectPatch {
    pub(crate) fn probe(sdk: i32) -> Option<Self> {
        (ANDROID_O..=ANDROID_MAX_SUPPORTED)
            .contains(&sdk)
            .then_some(Self { sdk })
    }

    pub(super) fn install(
        &self,
        bridge: &dyn VmBridge,
        target: &ResolvedMethod,
        entry: usize,
    ) -> Result<Installed, HookError> {
        let installed = prepare_backup(bridge, target)?;

        let mut patched = installed.original;
        patched.access_flags = mark_native(mark_non_compilable(patched.access_flags, self.sdk), self.sdk);
        patched.data = entry;
        patched.entry_point = bridge.generic_jni_trampoline();
        if let Err(err) = bridge.write_method(target.handle, &patched) {
            return Err(discard_backup(bridge, &installed, err.into()));
        }
        log::debug(format_args!(
            "patched {} entry 0x{:x} data 0x{entry:x}",
            target.identity(),
            patched.entry_point
        ));
        Ok(installed)
    }

    // 原始元数据完整保存，可以还原
    pub(super) fn uninstall(
        &self,
        bridge: &dyn VmBridge,
        record: &HookRecord,
    ) -> Result<UnhookOutcome, HookError> {
        bridge.write_method(record.target, &record.original)?;
        Ok(UnhookOutcome::Restored)
    }
}
