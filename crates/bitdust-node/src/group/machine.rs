//! Pure state machine of a group participant.
//!
//! No I/O here: `step` maps (state, event) to the next state plus the
//! actions the driver must execute. The driver feeds the outcome of
//! those actions back in as events.

/// Participant lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AtStartup,
    Disconnected,
    /// Reading the group owner's supplier slate from the DHT.
    ReadingSuppliers,
    /// Resolving brokers and attaching as consumer/producer.
    Subscribing,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Init,
    Connect,
    Reconnect,
    Disconnect,
    Shutdown,
    SuppliersReadSuccess,
    SuppliersReadFailed,
    SuppliersConnected,
    SuppliersDisconnected,
    PushMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ReadSuppliers,
    Subscribe,
    ReportConnected,
    ReportDisconnected,
    Unsubscribe,
    SendOutgoing,
    Destroy,
}

#[derive(Debug)]
pub struct Machine {
    pub state: State,
    /// A disconnect was requested while subscribing; honored once the
    /// subscribe settles.
    pub need_disconnect: bool,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: State::AtStartup,
            need_disconnect: false,
        }
    }

    pub fn step(&mut self, event: Event) -> Vec<Action> {
        use self::Action::*;
        use self::Event::*;
        use self::State::*;

        if event == Shutdown {
            self.state = Closed;
            return vec![Destroy];
        }

        match (self.state, event) {
            (AtStartup, Init) => {
                self.state = Disconnected;
                vec![]
            }
            (Disconnected, Connect) | (Disconnected, Reconnect) => {
                self.state = ReadingSuppliers;
                self.need_disconnect = false;
                vec![ReadSuppliers]
            }
            (ReadingSuppliers, SuppliersReadSuccess) => {
                self.state = Subscribing;
                vec![Subscribe]
            }
            (ReadingSuppliers, SuppliersReadFailed) => {
                self.state = Disconnected;
                vec![ReportDisconnected]
            }
            (ReadingSuppliers, Disconnect) | (Subscribing, Disconnect) => {
                self.need_disconnect = true;
                vec![]
            }
            (Subscribing, SuppliersConnected) => {
                if self.need_disconnect {
                    self.need_disconnect = false;
                    self.state = Disconnected;
                    vec![Unsubscribe]
                } else {
                    self.state = Connected;
                    vec![ReportConnected]
                }
            }
            (Subscribing, SuppliersDisconnected) => {
                self.state = Disconnected;
                vec![ReportDisconnected]
            }
            (Connected, PushMessage) => vec![SendOutgoing],
            (Connected, Reconnect) => {
                self.state = ReadingSuppliers;
                vec![ReadSuppliers]
            }
            (Connected, Disconnect) => {
                self.state = Disconnected;
                vec![Unsubscribe, ReportDisconnected]
            }
            _ => vec![],
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::Action::*;
    use super::Event::*;
    use super::State::*;

    #[test]
    fn startup_to_connected_path() {
        let mut m = Machine::new();
        assert_eq!(m.step(Init), vec![]);
        assert_eq!(m.state, Disconnected);

        assert_eq!(m.step(Connect), vec![ReadSuppliers]);
        assert_eq!(m.state, ReadingSuppliers);

        assert_eq!(m.step(SuppliersReadSuccess), vec![Subscribe]);
        assert_eq!(m.state, Subscribing);

        assert_eq!(m.step(SuppliersConnected), vec![ReportConnected]);
        assert_eq!(m.state, Connected);
    }

    #[test]
    fn slate_read_failure_reports_disconnected() {
        let mut m = Machine::new();
        m.step(Init);
        m.step(Connect);
        assert_eq!(m.step(SuppliersReadFailed), vec![ReportDisconnected]);
        assert_eq!(m.state, Disconnected);
    }

    #[test]
    fn disconnect_during_subscribe_is_deferred() {
        let mut m = Machine::new();
        m.step(Init);
        m.step(Connect);
        m.step(SuppliersReadSuccess);

        assert_eq!(m.step(Disconnect), vec![]);
        assert!(m.need_disconnect);

        // Once the subscribe settles, we unsubscribe instead of reporting
        // connected.
        assert_eq!(m.step(SuppliersConnected), vec![Unsubscribe]);
        assert_eq!(m.state, Disconnected);
        assert!(!m.need_disconnect);
    }

    #[test]
    fn push_keeps_connected() {
        let mut m = Machine::new();
        m.step(Init);
        m.step(Connect);
        m.step(SuppliersReadSuccess);
        m.step(SuppliersConnected);

        assert_eq!(m.step(PushMessage), vec![SendOutgoing]);
        assert_eq!(m.state, Connected);
    }

    #[test]
    fn reconnect_from_connected_rereads_slate() {
        let mut m = Machine::new();
        m.step(Init);
        m.step(Connect);
        m.step(SuppliersReadSuccess);
        m.step(SuppliersConnected);

        assert_eq!(m.step(Reconnect), vec![ReadSuppliers]);
        assert_eq!(m.state, ReadingSuppliers);
    }

    #[test]
    fn shutdown_from_any_state_closes() {
        for events in [
            vec![],
            vec![Init],
            vec![Init, Connect],
            vec![Init, Connect, SuppliersReadSuccess],
            vec![Init, Connect, SuppliersReadSuccess, SuppliersConnected],
        ] {
            let mut m = Machine::new();
            for e in events {
                m.step(e);
            }
            assert_eq!(m.step(Shutdown), vec![Destroy]);
            assert_eq!(m.state, Closed);
        }
    }

    #[test]
    fn stray_events_are_ignored() {
        let mut m = Machine::new();
        m.step(Init);
        assert_eq!(m.step(PushMessage), vec![]);
        assert_eq!(m.state, Disconnected);
        assert_eq!(m.step(SuppliersConnected), vec![]);
        assert_eq!(m.state, Disconnected);
    }
}
