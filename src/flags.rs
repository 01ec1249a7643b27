//! Per-package coverage flags and the `C` cycle over them.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageMode {
    AllOn,
    AllOff,
    Mixed,
}

impl CoverageMode {
    pub fn label(self) -> &'static str {
        match self {
            CoverageMode::AllOn => "all on",
            CoverageMode::AllOff => "all off",
            CoverageMode::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoverageFlags {
    flags: Vec<bool>,
    /// Last mixed configuration, restored when cycling out of all-off.
    snapshot: Option<Vec<bool>>,
}

impl CoverageFlags {
    pub fn new(count: usize, enabled: bool) -> Self {
        Self {
            flags: vec![enabled; count],
            snapshot: None,
        }
    }

    pub fn is_on(&self, id: usize) -> bool {
        self.flags.get(id).copied().unwrap_or(false)
    }

    pub fn mode(&self) -> CoverageMode {
        let on = self.flags.iter().filter(|flag| **flag).count();
        if on == self.flags.len() {
            CoverageMode::AllOn
        } else if on == 0 {
            CoverageMode::AllOff
        } else {
            CoverageMode::Mixed
        }
    }

    /// Flips one package. Returns true when it was turned on.
    pub fn toggle(&mut self, id: usize) -> bool {
        let Some(flag) = self.flags.get_mut(id) else {
            return false;
        };
        *flag = !*flag;
        *flag
    }

    /// Advances mixed → all-on → all-off → restore, returning the packages
    /// that were turned on by this step.
    pub fn cycle(&mut self) -> Vec<usize> {
        if self.flags.is_empty() {
            return Vec::new();
        }
        let before = self.flags.clone();
        match self.mode() {
            CoverageMode::Mixed => {
                self.snapshot = Some(before.clone());
                self.flags.iter_mut().for_each(|flag| *flag = true);
            }
            CoverageMode::AllOn => {
                self.flags.iter_mut().for_each(|flag| *flag = false);
            }
            CoverageMode::AllOff => match &self.snapshot {
                Some(snapshot) if snapshot.len() == self.flags.len() => {
                    self.flags.clone_from(snapshot);
                }
                _ => self.flags.iter_mut().for_each(|flag| *flag = true),
            },
        }
        self.flags
            .iter()
            .zip(before)
            .enumerate()
            .filter(|(_, (now, was))| **now && !*was)
            .map(|(id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(values: &[bool]) -> CoverageFlags {
        CoverageFlags {
            flags: values.to_vec(),
            snapshot: None,
        }
    }

    #[test]
    fn cycle_round_trips_mixed_configuration() {
        let mut state = flags(&[true, false, true]);
        assert_eq!(state.cycle(), vec![1]);
        assert_eq!(state.flags, vec![true, true, true]);
        assert!(state.cycle().is_empty());
        assert_eq!(state.flags, vec![false, false, false]);
        assert_eq!(state.cycle(), vec![0, 2]);
        assert_eq!(state.flags, vec![true, false, true]);
    }

    #[test]
    fn all_off_without_snapshot_turns_everything_on() {
        let mut state = CoverageFlags::new(2, false);
        assert_eq!(state.cycle(), vec![0, 1]);
        assert_eq!(state.mode(), CoverageMode::AllOn);
    }

    #[test]
    fn snapshot_only_changes_from_mixed() {
        let mut state = flags(&[true, false]);
        state.cycle();
        state.cycle();
        state.cycle();
        // Back to mixed; toggling to a new mixed state and cycling replaces it.
        state.toggle(1);
        state.toggle(0);
        assert_eq!(state.flags, vec![false, true]);
        state.cycle();
        state.cycle();
        assert_eq!(state.cycle(), vec![1]);
    }

    #[test]
    fn toggle_reports_new_state() {
        let mut state = CoverageFlags::new(2, false);
        assert!(state.toggle(1));
        assert!(state.is_on(1));
        assert!(!state.toggle(1));
        assert!(!state.toggle(9));
        assert_eq!(state.mode(), CoverageMode::AllOff);
    }

    #[test]
    fn empty_flag_set_cycles_to_nothing() {
        assert!(CoverageFlags::new(0, true).cycle().is_empty());
    }
}
