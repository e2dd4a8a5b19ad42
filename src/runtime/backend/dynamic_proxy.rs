// 动态生成 hooker 类，用 hooker 方法的入口替换目标方法入口
use crate::error::{HookError, VmError};
use crate::log;

use super::{
    ANDROID_MAX_SUPPORTED, ANDROID_N, HookerSpec, Installed, VmBridge, discard_backup,
    mark_non_compilable, prepare_backup,
};
use crate::runtime::descriptor::{AbiDescriptor, ResolvedMethod};

const HOOKER_CLASS_PREFIX: &str = "io.github.lsphook.Hooker_";

pub(crate) struct DynamicProxy {
    sdk: i32,
}

impl DynamicProxy {
    pub(crate) fn probe(sdk: i32) -> Option<Self> {
        (ANDROID_N..=ANDROID_MAX_SUPPORTED)
            .contains(&sdk)
            .then_some(Self { sdk })
    }

    pub(super) fn install(
        &self,
        bridge: &dyn VmBridge,
        target: &ResolvedMethod,
        abi: &AbiDescriptor,
        entry: usize,
    ) -> Result<Installed, HookError> {
        let installed = prepare_backup(bridge, target)?;
        self.bind_hooker(bridge, target, abi, entry, &installed)
            .map_err(|err| discard_backup(bridge, &installed, err))?;
        Ok(installed)
    }

    fn bind_hooker(
        &self,
        bridge: &dyn VmBridge,
        target: &ResolvedMethod,
        abi: &AbiDescriptor,
        entry: usize,
        installed: &Installed,
    ) -> Result<(), HookError> {
        let spec = HookerSpec {
            class_name: format!("{HOOKER_CLASS_PREFIX}{}_{:x}", abi.shorty(), target.handle.0),
            target: target.identity().clone(),
            abi: abi.as_static_form(),
            native_entry: entry,
        };
        let hooker = bridge.define_hooker(&spec).map_err(|err| match err {
            VmError::Unsupported(reason) => HookError::IncompatibleVm(reason),
            other => HookError::from(other),
        })?;
        let hooker_record = bridge.read_method(hooker)?;

        // data 指向 hooker 方法本身，由入口跳板切换被调方法
        let mut patched = installed.original;
        patched.access_flags = mark_non_compilable(patched.access_flags, self.sdk);
        patched.entry_point = hooker_record.entry_point;
        patched.data = hooker.0;
        bridge.write_method(target.handle, &patched)?;
        log::debug(format_args!(
            "{} now routed through {}",
            target.identity(),
            spec.class_name
        ));
        Ok(())
    }
}
