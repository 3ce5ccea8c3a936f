//! Crate-internal logging macros.
//!
//! With the `tracing` feature every macro forwards to the matching `tracing` macro under the
//! `btp_relay` target. Without it the macros only evaluate their field expressions so that call
//! sites compile identically in both configurations.
//!
//! Call sites use structured fields followed by a message literal, e.g.
//! `warn!(height = current, error = %err, "Block fetch failed")`.

#[cfg(feature = "tracing")]
#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)*) => {
        tracing::error!(target: "btp_relay", $($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::__relay_log_consume!($($arg)*)
    };
}

#[cfg(feature = "tracing")]
#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "btp_relay", $($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::__relay_log_consume!($($arg)*)
    };
}

#[cfg(feature = "tracing")]
#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {
        tracing::info!(target: "btp_relay", $($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::__relay_log_consume!($($arg)*)
    };
}

#[cfg(feature = "tracing")]
#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "btp_relay", $($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::__relay_log_consume!($($arg)*)
    };
}

#[cfg(feature = "tracing")]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "btp_relay", $($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::__relay_log_consume!($($arg)*)
    };
}

#[doc(hidden)]
#[macro_export]
#[cfg(not(feature = "tracing"))]
#[allow(unused_macros)]
macro_rules! __relay_log_consume {
    ($field:ident = % $value:expr, $($rest:tt)*) => {
        { let _ = &$value; $crate::__relay_log_consume!($($rest)*); }
    };
    ($field:ident = ? $value:expr, $($rest:tt)*) => {
        { let _ = &$value; $crate::__relay_log_consume!($($rest)*); }
    };
    ($field:ident = $value:expr, $($rest:tt)*) => {
        { let _ = &$value; $crate::__relay_log_consume!($($rest)*); }
    };
    ($lit:literal $($rest:tt)*) => {
        $crate::__relay_log_consume!($($rest)*)
    };
    () => {};
}
