// On the kernel target everything goes out over serial. Hosted builds (unit
// tests) fall back to the standard streams.

#[cfg(target_os = "none")]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($crate::serial::SerialPort, "{}", format_args!($($arg)*));
    }};
}

#[cfg(not(target_os = "none"))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        std::print!("{}", format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}

#[cfg(target_os = "none")]
#[macro_export]
macro_rules! eprint {
    ($($arg:tt)*) => {
        $crate::print!($($arg)*)
    };
}

#[cfg(not(target_os = "none"))]
#[macro_export]
macro_rules! eprint {
    ($($arg:tt)*) => {{
        std::eprint!("{}", format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! eprintln {
    () => {
        $crate::eprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::eprint!("{}\n", format_args!($($arg)*))
    };
}
