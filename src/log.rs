//! Logging interface, contingent on the `log` or `defmt-03` features
//!
//! Only enable logging when debugging, and when you're certain that your
//! logger isn't using USB!
//!
//! Arguments are limited to primitives so that the same format string is
//! understood by both back-ends.

macro_rules! trace {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::trace!($($args)*);
        #[cfg(feature = "defmt-03")]
        defmt::trace!($($args)*);
        #[cfg(not(any(feature = "log", feature = "defmt-03")))]
        let _ = format_args!($($args)*);
    }};
}

macro_rules! debug {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::debug!($($args)*);
        #[cfg(feature = "defmt-03")]
        defmt::debug!($($args)*);
        #[cfg(not(any(feature = "log", feature = "defmt-03")))]
        let _ = format_args!($($args)*);
    }};
}

macro_rules! warn {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::warn!($($args)*);
        #[cfg(feature = "defmt-03")]
        defmt::warn!($($args)*);
        #[cfg(not(any(feature = "log", feature = "defmt-03")))]
        let _ = format_args!($($args)*);
    }};
}
