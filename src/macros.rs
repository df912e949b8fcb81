#![allow(unused_macros)]

macro_rules! trace {
    ($($t:tt)*) => {
        log!(trace, $($t)*)
    }
}

macro_rules! debug {
    ($($t:tt)*) => {
        log!(debug, $($t)*)
    }
}

macro_rules! info {
    ($($t:tt)*) => {
        log!(info, $($t)*)
    }
}

macro_rules! warn {
    ($($t:tt)*) => {
        log!(warn, $($t)*)
    }
}

macro_rules! error {
    ($($t:tt)*) => {
        log!(error, $($t)*)
    }
}

// `tracing` wins when both backends are enabled. The outer block keeps the
// expansion a single expression, so the macros also work as match arms.
macro_rules! log {
    ($level: ident, $($t:tt)*) => {{
        #[cfg(feature = "tracing")]
        { ::tracing::$level!($($t)*); }
        #[cfg(all(feature = "log", not(feature = "tracing")))]
        { ::log::$level!($($t)*); }
        // Silence unused variables warnings.
        #[cfg(not(any(feature = "log", feature = "tracing")))]
        { if false { let _ = format_args!($($t)*); } }
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn log_macros_expand_as_match_arms() {
        let routed = |n: u32| match n {
            0 => trace!("zero"),
            1 => debug!("one {}", n),
            2 => info!("two"),
            3 => warn!("three {}", n),
            _ => error!("other {}", n),
        };
        for n in 0..5 {
            routed(n);
        }
    }
}
