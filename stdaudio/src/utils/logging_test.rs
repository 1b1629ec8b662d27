#[cfg(test)]
mod tests {
    use super::super::logging::init_logging;

    #[test]
    fn test_logging_initialization_is_repeatable() {
        // Other tests in the process may have installed a subscriber already,
        // so only the second call's result is known.
        init_logging();
        assert!(!init_logging());
        tracing::debug!("logging still usable after repeated init");
    }
}
