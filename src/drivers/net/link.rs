//! Link monitor
//!
//! Tracks the last resolved [`LinkState`] and reports transitions. Sensing
//! is the backend's job (direct status register or [`mii::read_link`]); the
//! monitor only decides whether a sample is news.
//!
//! [`mii::read_link`]: crate::drivers::net::mii::read_link

use crate::drivers::net::netdev::LinkState;

#[derive(Debug, Default)]
pub struct LinkMonitor {
    state: LinkState,
}

impl LinkMonitor {
    pub const fn new() -> Self {
        Self {
            state: LinkState::Unknown,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Forget the current state; the next link-up sample is always reported
    pub fn invalidate(&mut self) {
        self.state = LinkState::Unknown;
    }

    /// Record a sample; returns the new state if it is news
    ///
    /// Going from unknown to down is recorded but not reported: nothing
    /// above has been told the link was ever up.
    pub fn update(&mut self, sensed: LinkState) -> Option<LinkState> {
        if sensed == self.state {
            return None;
        }
        let previous = core::mem::replace(&mut self.state, sensed);
        if previous == LinkState::Unknown && sensed == LinkState::Down {
            return None;
        }
        Some(sensed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::net::netdev::{Duplex, LinkSpeed};

    const UP_100: LinkState = LinkState::Up {
        speed: LinkSpeed::Mbps100,
        duplex: Duplex::Full,
    };

    #[test]
    fn test_only_transitions_reported() {
        let mut monitor = LinkMonitor::new();
        monitor.update(UP_100);

        assert_eq!(monitor.update(UP_100), None);
        assert_eq!(monitor.update(LinkState::Down), Some(LinkState::Down));
        assert_eq!(monitor.update(LinkState::Down), None);
        assert_eq!(monitor.update(UP_100), Some(UP_100));
        assert_eq!(monitor.state(), UP_100);
    }

    #[test]
    fn test_first_down_sample_is_silent() {
        let mut monitor = LinkMonitor::new();

        assert_eq!(monitor.update(LinkState::Down), None);
        assert_eq!(monitor.state(), LinkState::Down);
        assert_eq!(monitor.update(UP_100), Some(UP_100));
    }

    #[test]
    fn test_speed_change_is_a_transition() {
        let mut monitor = LinkMonitor::new();
        monitor.update(UP_100);

        let slower = LinkState::Up {
            speed: LinkSpeed::Mbps10,
            duplex: Duplex::Full,
        };
        assert_eq!(monitor.update(slower), Some(slower));
    }

    #[test]
    fn test_invalidate_reports_next_link_up() {
        let mut monitor = LinkMonitor::new();
        monitor.update(UP_100);
        monitor.invalidate();

        assert_eq!(monitor.update(LinkState::Down), None);
        monitor.invalidate();
        assert_eq!(monitor.update(UP_100), Some(UP_100));
    }
}
