use serde::{Deserialize, Serialize};

// ── AutomationEvent ─────────────────────────────────────────────────────────

/// A single parameter change anchored to audio-clock seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AutomationEvent {
    /// Jump to `value` at `at`.
    Set { at: f64, value: f32 },
    /// Move linearly from whatever the lane holds at `start` to `target` at `end`.
    Ramp { start: f64, end: f64, target: f32 },
}

impl AutomationEvent {
    pub fn start(&self) -> f64 {
        match *self {
            AutomationEvent::Set { at, .. } => at,
            AutomationEvent::Ramp { start, .. } => start,
        }
    }

    pub fn end(&self) -> f64 {
        match *self {
            AutomationEvent::Set { at, .. } => at,
            AutomationEvent::Ramp { end, .. } => end,
        }
    }

    #[inline]
    fn evaluate(&self, from: f32, t: f64) -> f32 {
        match *self {
            AutomationEvent::Set { value, .. } => value,
            AutomationEvent::Ramp { start, end, target } => {
                if t >= end || end <= start {
                    target
                } else {
                    let p = ((t - start) / (end - start)).clamp(0.0, 1.0) as f32;
                    from + (target - from) * p
                }
            }
        }
    }
}

// ── AutomationLane ──────────────────────────────────────────────────────────

/// Time-ordered automation for one gain parameter.
///
/// Later events take over from the value the lane holds at their start, so a
/// ramp issued while another is in flight continues from the current level
/// rather than jumping.
#[derive(Debug, Clone, PartialEq)]
pub struct AutomationLane {
    base: f32,
    events: Vec<AutomationEvent>,
}

impl AutomationLane {
    pub fn new(value: f32) -> Self {
        Self {
            base: value,
            events: Vec::new(),
        }
    }

    pub fn set_at(&mut self, at: f64, value: f32) {
        self.insert(AutomationEvent::Set { at, value });
    }

    pub fn ramp(&mut self, start: f64, end: f64, target: f32) {
        self.insert(AutomationEvent::Ramp {
            start,
            end: end.max(start),
            target,
        });
    }

    pub fn insert(&mut self, event: AutomationEvent) {
        let idx = self.events.partition_point(|e| e.start() <= event.start());
        self.events.insert(idx, event);
    }

    pub fn value_at(&self, t: f64) -> f32 {
        let mut active: Option<(AutomationEvent, f32)> = None;
        for e in &self.events {
            if e.start() > t {
                break;
            }
            let from = match active {
                None => self.base,
                Some((prev, prev_from)) => prev.evaluate(prev_from, e.start()),
            };
            active = Some((*e, from));
        }
        match active {
            None => self.base,
            Some((e, from)) => e.evaluate(from, t),
        }
    }

    /// Drop every scheduled event and pin the lane to `value`.
    pub fn cancel_all(&mut self, value: f32) {
        self.events.clear();
        self.base = value;
    }

    /// Fold events that no longer influence anything after `t` into the base value.
    pub fn prune(&mut self, t: f64) {
        let Some(last_started) = self.events.iter().rposition(|e| e.start() <= t) else {
            return;
        };
        if last_started == self.events.len() - 1 && self.events[last_started].end() <= t {
            self.base = self.value_at(t);
            self.events.clear();
            return;
        }
        if last_started == 0 {
            return;
        }
        let new_base = self.value_at_before(last_started, self.events[last_started].start());
        self.base = new_base;
        self.events.drain(..last_started);
    }

    pub fn is_settled_after(&self, t: f64) -> bool {
        self.events.iter().all(|e| e.end() <= t)
    }

    pub fn pending(&self) -> &[AutomationEvent] {
        &self.events
    }

    fn value_at_before(&self, idx: usize, t: f64) -> f32 {
        let mut active: Option<(AutomationEvent, f32)> = None;
        for e in &self.events[..idx] {
            let from = match active {
                None => self.base,
                Some((prev, prev_from)) => prev.evaluate(prev_from, e.start()),
            };
            active = Some((*e, from));
        }
        match active {
            None => self.base,
            Some((e, from)) => e.evaluate(from, t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_base_without_events() {
        let lane = AutomationLane::new(0.7);
        assert_eq!(lane.value_at(123.0), 0.7);
    }

    #[test]
    fn ramp_interpolates_linearly() {
        let mut lane = AutomationLane::new(0.0);
        lane.ramp(10.0, 12.0, 1.0);
        assert_eq!(lane.value_at(9.0), 0.0);
        assert!((lane.value_at(11.0) - 0.5).abs() < 1e-6);
        assert_eq!(lane.value_at(12.0), 1.0);
        assert_eq!(lane.value_at(50.0), 1.0);
    }

    #[test]
    fn set_is_instant() {
        let mut lane = AutomationLane::new(1.0);
        lane.set_at(5.0, 0.0);
        assert_eq!(lane.value_at(4.999), 1.0);
        assert_eq!(lane.value_at(5.0), 0.0);
    }

    #[test]
    fn overlapping_ramp_continues_from_current_level() {
        let mut lane = AutomationLane::new(1.0);
        lane.ramp(0.0, 10.0, 0.0);
        lane.ramp(5.0, 6.0, 1.0);
        // First ramp is at 0.5 when the second takes over.
        assert!((lane.value_at(5.5) - 0.75).abs() < 1e-6);
        assert_eq!(lane.value_at(6.0), 1.0);
    }

    #[test]
    fn out_of_order_inserts_are_sorted() {
        let mut lane = AutomationLane::new(0.0);
        lane.set_at(8.0, 0.25);
        lane.set_at(2.0, 0.75);
        assert_eq!(lane.value_at(3.0), 0.75);
        assert_eq!(lane.value_at(9.0), 0.25);
    }

    #[test]
    fn prune_keeps_values_identical() {
        let mut lane = AutomationLane::new(1.0);
        lane.ramp(0.0, 4.0, 0.0);
        lane.ramp(4.0, 8.0, 0.5);
        lane.ramp(8.0, 12.0, 1.0);
        let before: Vec<f32> = (0..13).map(|t| lane.value_at(t as f64)).collect();

        lane.prune(9.0);
        assert_eq!(lane.pending().len(), 1);
        for t in 9..13 {
            assert!((lane.value_at(t as f64) - before[t]).abs() < 1e-6);
        }

        lane.prune(20.0);
        assert!(lane.pending().is_empty());
        assert_eq!(lane.value_at(20.0), 1.0);
    }

    #[test]
    fn cancel_all_pins_value() {
        let mut lane = AutomationLane::new(0.0);
        lane.ramp(0.0, 10.0, 1.0);
        lane.cancel_all(1.0);
        assert!(lane.pending().is_empty());
        assert_eq!(lane.value_at(3.0), 1.0);
        assert!(lane.is_settled_after(0.0));
    }
}
