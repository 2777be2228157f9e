/// Back-pressure on nested task creation: when in-flight tasks exceed the
/// pressure threshold, `task_create` cooperatively executes ready work
/// before returning, bounding memory consumption.
pub(crate) struct Throttle {
    enabled: bool,
    pressure: usize,
}

impl Throttle {
    pub(crate) fn new(enabled: bool, pressure: usize) -> Self {
        Self { enabled, pressure }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.enabled
    }

    /// True when the creator should run ready work before adding more.
    pub(crate) fn should_engage(&self, in_flight: usize) -> bool {
        self.enabled && in_flight > self.pressure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engages_only_above_pressure() {
        let throttle = Throttle::new(true, 100);
        assert!(!throttle.should_engage(100));
        assert!(throttle.should_engage(101));

        let off = Throttle::new(false, 0);
        assert!(!off.should_engage(usize::MAX));
    }
}
