#[macro_export]
macro_rules! wrapper {
    // Single expression (like a function name or closure)
    ($f:expr) => {{
        $f()
    }};
    ($f:expr, $( $args:expr $(,)? )* ) => {{
        $f( $($args,)* )
    }};
}
#[macro_export]
macro_rules! retry {
    ($( $args:expr$(,)? )+) => {{
        let mut wait: u64 = 5;
        loop {
            let res = $crate::wrapper!($( $args, )*);
            if res.is_ok() {
                break res;
            }
            if wait <= 20 {
                thread::sleep(std::time::Duration::from_secs(wait));
                wait *= 2;
                continue;
            }
            break res;
        }
    }};
}

/// Bounded variant of [`retry`] for the gateway's `Transient` errors: at
/// most 3 attempts total, doubling backoff starting at `$start_ms`
/// milliseconds rather than whole seconds, since gateway round-trips are
/// fast and a multi-second stall would stack up behind the per-vehicle lock.
#[macro_export]
macro_rules! retry_transient {
    ($start_ms:expr, $( $args:expr$(,)? )+) => {{
        let mut wait_ms: u64 = $start_ms;
        let mut attempt = 1;
        loop {
            let res = $crate::wrapper!($( $args, )*);
            match res {
                Ok(v) => break Ok(v),
                Err($crate::errors::GatewayError::Transient(e)) if attempt < 3 => {
                    log::warn!("gateway: transient error on attempt {attempt}/3: {e}");
                    std::thread::sleep(std::time::Duration::from_millis(wait_ms));
                    wait_ms *= 2;
                    attempt += 1;
                    continue;
                }
                Err(e) => break Err(e),
            }
        }
    }};
}
