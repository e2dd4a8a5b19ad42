// 内联调用方反优化：被 hook 的方法可能已被编译进调用方，按白名单把这些调用方打回解释执行
use crate::error::HookError;
use crate::log;
use dashmap::DashSet;
use std::collections::HashMap;

use super::backend::{self, VmBridge};
use super::descriptor::{ResolvedMethod, parse_method_signature};
use super::value::{ClassLoaderRef, MethodHandle};

pub const KEY_BOOT_IMAGE: &str = "boot_image";
pub const KEY_BOOT_IMAGE_MIUI_RES: &str = "boot_image_miui_res";
pub const KEY_SYSTEM_SERVER: &str = "system_server";

// (类名, 方法名, 签名)
type RawEntry = (&'static str, &'static str, &'static str);

// Application#attach 与资源加载的内联调用方
const BOOT_IMAGE: &[RawEntry] = &[
    (
        "android.app.Instrumentation",
        "newApplication",
        "(Ljava/lang/ClassLoader;Ljava/lang/String;Landroid/content/Context;)Landroid/app/Application;",
    ),
    (
        "android.app.Instrumentation",
        "newApplication",
        "(Ljava/lang/Class;Landroid/content/Context;)Landroid/app/Application;",
    ),
    (
        "android.content.res.TypedArray",
        "obtain",
        "(Landroid/content/res/Resources;I)Landroid/content/res/TypedArray;",
    ),
    (
        "android.app.ContextImpl",
        "getSharedPreferencesPath",
        "(Ljava/lang/String;)Ljava/io/File;",
    ),
];

const BOOT_IMAGE_MIUI_RES: &[RawEntry] = &[
    ("android.content.res.MiuiResources", "init", "(Ljava/lang/String;)V"),
    ("android.content.res.MiuiResources", "updateMiuiImpl", "()V"),
    (
        "android.content.res.MiuiResources",
        "setImpl",
        "(Landroid/content/res/ResourcesImpl;)V",
    ),
    (
        "android.content.res.MiuiResources",
        "loadOverlayValue",
        "(Landroid/util/TypedValue;I)V",
    ),
    (
        "android.content.res.MiuiResources",
        "getThemeString",
        "(I)Ljava/lang/CharSequence;",
    ),
    ("android.content.res.MiuiResources", "<init>", "(Ljava/lang/ClassLoader;)V"),
    ("android.content.res.MiuiResources", "<init>", "()V"),
    (
        "android.miui.ResourcesManager",
        "initMiuiResource",
        "(Landroid/content/res/Resources;Ljava/lang/String;)V",
    ),
    ("android.app.LoadedApk", "getResources", "()Landroid/content/res/Resources;"),
    ("android.content.res.Resources", "getSystem", "()Landroid/content/res/Resources;"),
    (
        "android.app.ApplicationPackageManager",
        "getResourcesForApplication",
        "(Landroid/content/pm/ApplicationInfo;)Landroid/content/res/Resources;",
    ),
    (
        "android.app.ContextImpl",
        "setResources",
        "(Landroid/content/res/Resources;)V",
    ),
];

const PACKAGE_WECHAT: &[RawEntry] = &[(
    "com.tencent.mm.app.Application",
    "attachBaseContext",
    "(Landroid/content/Context;)V",
)];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeoptEntry {
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
}

impl DeoptEntry {
    pub fn new(class_name: &str, method_name: &str, signature: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            signature: signature.to_string(),
        }
    }
}

impl From<&RawEntry> for DeoptEntry {
    fn from(raw: &RawEntry) -> Self {
        Self::new(raw.0, raw.1, raw.2)
    }
}

// 按上下文键分组的白名单，构造后只读
#[derive(Clone, Debug, Default)]
pub struct DeoptWhitelist {
    entries: HashMap<String, Vec<DeoptEntry>>,
}

impl DeoptWhitelist {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut whitelist = Self::empty();
        for (key, raw) in [
            (KEY_BOOT_IMAGE, BOOT_IMAGE),
            (KEY_BOOT_IMAGE_MIUI_RES, BOOT_IMAGE_MIUI_RES),
            (KEY_SYSTEM_SERVER, &[][..]),
            ("com.tencent.mm", PACKAGE_WECHAT),
        ] {
            whitelist
                .entries
                .insert(key.to_string(), raw.iter().map(DeoptEntry::from).collect());
        }
        whitelist
    }

    pub fn with_entry(mut self, key: &str, entry: DeoptEntry) -> Self {
        self.entries.entry(key.to_string()).or_default().push(entry);
        self
    }

    pub fn entries(&self, key: &str) -> &[DeoptEntry] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeoptReport {
    pub deoptimized: usize,
    // 之前已经反优化过，且之后没有被重新编译
    pub skipped: usize,
    pub missing: usize,
    pub failed: usize,
}

pub(crate) struct Deoptimizer {
    whitelist: DeoptWhitelist,
    // 反优化在 fork 后依然有效，不随 fork 清空；命中时仍要确认方法没有被重新编译
    done: DashSet<MethodHandle>,
}

impl Deoptimizer {
    pub(crate) fn new(whitelist: DeoptWhitelist) -> Self {
        Self {
            whitelist,
            done: DashSet::new(),
        }
    }

    pub(crate) fn whitelist(&self) -> &DeoptWhitelist {
        &self.whitelist
    }

    // 单条失败只记录，不影响后续条目
    pub(crate) fn deopt(
        &self,
        bridge: &dyn VmBridge,
        key: &str,
        loader: ClassLoaderRef,
    ) -> DeoptReport {
        let mut report = DeoptReport::default();
        for entry in self.whitelist.entries(key) {
            let params = match parse_method_signature(&entry.signature) {
                Ok((params, _)) => params,
                Err(err) => {
                    log::warn(format_args!("deopt[{key}] bad entry {}: {err}", entry.class_name));
                    report.failed += 1;
                    continue;
                }
            };
            let method = match bridge.find_method(loader, &entry.class_name, &entry.method_name, &params) {
                Ok(method) => method,
                Err(err) if err.is_missing() => {
                    log::debug(format_args!(
                        "deopt[{key}] skip {}.{}: {err}",
                        entry.class_name, entry.method_name
                    ));
                    report.missing += 1;
                    continue;
                }
                Err(err) => {
                    log::warn(format_args!(
                        "deopt[{key}] lookup {}.{} failed: {err}",
                        entry.class_name, entry.method_name
                    ));
                    report.failed += 1;
                    continue;
                }
            };
            match self.deopt_method(bridge, &method) {
                Ok(true) => report.deoptimized += 1,
                Ok(false) => report.skipped += 1,
                Err(err) => {
                    log::warn(format_args!("deopt[{key}] {err}"));
                    report.failed += 1;
                }
            }
        }
        log::info(format_args!("deopt[{key}] {report:?}"));
        report
    }

    // 返回 false 表示之前已处理且仍未重新编译；JIT 重新编译过的方法会再次反优化
    pub(crate) fn deopt_method(
        &self,
        bridge: &dyn VmBridge,
        method: &ResolvedMethod,
    ) -> Result<bool, HookError> {
        if self.done.contains(&method.handle) && !bridge.is_compiled(method.handle) {
            return Ok(false);
        }
        backend::deoptimize(bridge, method.handle, method.identity())?;
        self.done.insert(method.handle);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_signatures_parse() {
        let whitelist = DeoptWhitelist::builtin();
        for key in [KEY_BOOT_IMAGE, KEY_BOOT_IMAGE_MIUI_RES, KEY_SYSTEM_SERVER] {
            assert!(whitelist.contains_key(key));
            for entry in whitelist.entries(key) {
                assert!(
                    parse_method_signature(&entry.signature).is_ok(),
                    "{entry:?}"
                );
            }
        }
        assert!(whitelist.entries("no.such.package").is_empty());
    }

    #[test]
    fn custom_entries_extend_keys() {
        let whitelist = DeoptWhitelist::empty()
            .with_entry("com.example", DeoptEntry::new("a.B", "c", "()V"))
            .with_entry("com.example", DeoptEntry::new("a.B", "d", "(I)V"));
        assert_eq!(whitelist.entries("com.example").len(), 2);
    }
}
