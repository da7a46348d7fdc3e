/// Helper macro to execute a system call that returns an `io::Result`.
//
// Macros must be defined before any module that uses them.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Like `syscall!`, but retries on `EINTR`.
macro_rules! syscall_eintr {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        loop {
            let res = unsafe { libc::$fn($($arg, )*) };
            if res == -1 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                break Err(err);
            }
            break Ok(res);
        }
    }};
}
