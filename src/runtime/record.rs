// hook/unhook/deopt 操作的审计记录：环形缓冲，按字段掩码导出 CSV
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

// 操作记录字段掩码
pub const RECORD_ITEM_ALL: u32 = 0x7F;
pub const RECORD_ITEM_TIMESTAMP: u32 = 1 << 0;
pub const RECORD_ITEM_OP: u32 = 1 << 1;
pub const RECORD_ITEM_METHOD: u32 = 1 << 2;
pub const RECORD_ITEM_BACKEND: u32 = 1 << 3;
pub const RECORD_ITEM_STATUS: u32 = 1 << 4;
pub const RECORD_ITEM_TARGET: u32 = 1 << 5;
pub const RECORD_ITEM_ENTRY: u32 = 1 << 6;

// 超出后淘汰最早的记录
const MAX_RECORDS: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOp {
    Hook,
    Unhook,
    Deopt,
}

impl RecordOp {
    fn name(self) -> &'static str {
        match self {
            Self::Hook => "HOOK",
            Self::Unhook => "UNHOOK",
            Self::Deopt => "DEOPT",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordEntry {
    pub op: RecordOp,
    pub ts_ms: u64,
    // 0 成功，其余为 HookError::code()
    pub status_code: i32,
    pub method: String,
    pub backend: &'static str,
    pub target: usize,
    pub entry: usize,
}

impl RecordEntry {
    pub fn new(op: RecordOp, method: String, status_code: i32) -> Self {
        Self {
            op,
            ts_ms: now_ms(),
            status_code,
            method,
            backend: "",
            target: 0,
            entry: 0,
        }
    }
}

#[inline]
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Default)]
pub(crate) struct RecordLog {
    enabled: bool,
    entries: VecDeque<RecordEntry>,
}

impl RecordLog {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    // 关闭时静默丢弃
    pub(crate) fn push(&mut self, entry: RecordEntry) {
        if !self.enabled {
            return;
        }
        if self.entries.len() >= MAX_RECORDS {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn text(&self, item_flags: u32) -> Option<String> {
        if !self.enabled || self.entries.is_empty() {
            return None;
        }
        let mut output = String::new();
        for entry in &self.entries {
            format_entry(&mut output, entry, item_flags);
        }
        Some(output)
    }
}

// 按位掩码选择字段，每行以逗号分隔
fn format_entry(line: &mut String, entry: &RecordEntry, item_flags: u32) {
    if item_flags & RECORD_ITEM_TIMESTAMP != 0 {
        let _ = write!(line, "{},", entry.ts_ms);
    }
    if item_flags & RECORD_ITEM_OP != 0 {
        let _ = write!(line, "{},", entry.op.name());
    }
    if item_flags & RECORD_ITEM_METHOD != 0 {
        let _ = write!(line, "{},", entry.method);
    }
    if item_flags & RECORD_ITEM_BACKEND != 0 {
        let _ = write!(line, "{},", entry.backend);
    }
    if item_flags & RECORD_ITEM_STATUS != 0 {
        let _ = write!(line, "{},", entry.status_code);
    }
    if item_flags & RECORD_ITEM_TARGET != 0 {
        let _ = write!(line, "0x{:x},", entry.target);
    }
    if item_flags & RECORD_ITEM_ENTRY != 0 {
        let _ = write!(line, "0x{:x},", entry.entry);
    }
    line.push('\n');
}

pub(crate) fn dump_text(writer: &mut dyn io::Write, text: &str) -> io::Result<()> {
    writer.write_all(text.as_bytes())?;
    writer.flush()
}
