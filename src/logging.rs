// Each level is an independent feature so consumers can strip what they do
// not want; the disabled form still type-checks its arguments.

#[cfg(feature = "log-error")]
macro_rules! error {
    ($($arg:tt)+) => (log::error!($($arg)+))
}

#[cfg(not(feature = "log-error"))]
macro_rules! error {
    ($($arg:tt)+) => {{
        if false {
            let _ = format_args!($($arg)+);
        }
    }};
}

#[cfg(feature = "log-warn")]
macro_rules! warn {
    ($($arg:tt)+) => (log::warn!($($arg)+))
}

#[cfg(not(feature = "log-warn"))]
macro_rules! warn {
    ($($arg:tt)+) => {{
        if false {
            let _ = format_args!($($arg)+);
        }
    }};
}

#[cfg(feature = "log-info")]
macro_rules! info {
    ($($arg:tt)+) => (log::info!($($arg)+))
}

#[cfg(not(feature = "log-info"))]
macro_rules! info {
    ($($arg:tt)+) => {{
        if false {
            let _ = format_args!($($arg)+);
        }
    }};
}

#[cfg(feature = "log-debug")]
macro_rules! debug {
    ($($arg:tt)+) => (log::debug!($($arg)+))
}

#[cfg(not(feature = "log-debug"))]
macro_rules! debug {
    ($($arg:tt)+) => {{
        if false {
            let _ = format_args!($($arg)+);
        }
    }};
}
