use chrono::Local;
use std::fmt;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
    Debug,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERRO",
            Level::Debug => "DEBG",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Level::Info => "\x1b[32m",  // Green
            Level::Warn => "\x1b[33m",  // Yellow
            Level::Error => "\x1b[31m", // Red
            Level::Debug => "\x1b[34m", // Blue
        }
    }

    fn to_stderr(self) -> bool {
        matches!(self, Level::Warn | Level::Error)
    }
}

/// 开关 debug 级别输出 (由配置项 `debug` 控制)
pub fn set_debug(enabled: bool) {
    DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// 拼出一行日志：`[Time] [LEVEL] [Target] Message`
///
/// 输出目标不是终端时不带 ANSI 颜色。
pub fn render(level: Level, target: &str, args: fmt::Arguments, color: bool) -> String {
    let now = Local::now().format("%H:%M:%S");
    if !color {
        return format!("[{}] [{}] [{}] {}", now, level.label(), target, args);
    }

    const GRAY: &str = "\x1b[90m";
    const CYAN: &str = "\x1b[36m";
    const RESET: &str = "\x1b[0m";
    format!(
        "{GRAY}[{now}] {}[{}]{RESET} {CYAN}[{target}]{RESET} {args}",
        level.color(),
        level.label(),
    )
}

/// 统一日志输出函数，警告与错误写 stderr
pub fn print(level: Level, target: &str, args: fmt::Arguments) {
    if level == Level::Debug && !debug_enabled() {
        return;
    }

    if level.to_stderr() {
        let color = std::io::stderr().is_terminal();
        eprintln!("{}", render(level, target, args, color));
    } else {
        let color = std::io::stdout().is_terminal();
        println!("{}", render(level, target, args, color));
    }
}

#[macro_export]
macro_rules! info {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Info, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Info, "Bridge", format_args!($($arg)+))
    );
}

#[macro_export]
macro_rules! warn {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Warn, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Warn, "Bridge", format_args!($($arg)+))
    );
}

#[macro_export]
macro_rules! error {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Error, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Error, "Bridge", format_args!($($arg)+))
    );
}

#[macro_export]
macro_rules! debug {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Debug, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Debug, "Bridge", format_args!($($arg)+))
    );
}
