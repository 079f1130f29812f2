use std::any::Any;

pub type FHashMap<K, V> = fnv::FnvHashMap<K, V>;
pub type UHashMap<T> = FHashMap<usize, T>;

#[macro_export]
macro_rules! div_round_up(
    ($a:expr, $b:expr) => {
        (($a) + ($b) - 1) / ($b)
    };
);

/// Extracts the message from a caught panic payload.
pub fn panic_msg(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::panic_msg;
    use std::panic;

    #[test]
    fn test_div_round_up() {
        assert_eq!(div_round_up!(10u64, 8), 2);
        assert_eq!(div_round_up!(16u64, 8), 2);
        assert_eq!(div_round_up!(0u64, 8), 0);
    }

    #[test]
    fn test_panic_msg() {
        let res = panic::catch_unwind(|| panic!("boom {}", 1));
        assert_eq!(panic_msg(&res.unwrap_err()), "boom 1");
        let res = panic::catch_unwind(|| panic!("static"));
        assert_eq!(panic_msg(&res.unwrap_err()), "static");
    }
}
