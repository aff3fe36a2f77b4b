//! Kernel print utilities.
//!
//! The hypervisor owns no output device. The driver that hosts it registers a
//! diagnostic sink with [`set_sink`]; until then every message is discarded.

use core::sync::atomic::{AtomicUsize, Ordering};

static SINK: AtomicUsize = AtomicUsize::new(0);

/// Register the function that receives every formatted message.
///
/// The sink may be called from VM-exit context on any core, so it must not
/// block on locks held by the guest.
pub fn set_sink(sink: fn(core::fmt::Arguments<'_>)) {
    SINK.store(sink as usize, Ordering::Release);
}

/// Detach the current sink.
pub fn clear_sink() {
    SINK.store(0, Ordering::Release);
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let raw = SINK.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: the only non-zero values ever stored come from `set_sink`.
        let sink: fn(core::fmt::Arguments<'_>) = unsafe { core::mem::transmute(raw) };
        sink(fmt);
    }
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the diagnostic sink.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[INFO] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[WARNING] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}

/// Display an error message.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[ERROR] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}

/// Print msg if debug build
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            $crate::kprint::_print(
                format_args!(
                    "[DEBUG] {}\n",
                    format_args!($($arg)*)
                )
            )
        }
    }
}
