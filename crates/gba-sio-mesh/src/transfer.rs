use crate::registers::SioMulti;

/// One round's transfer state. Only the six transitions in the table below
/// may occur; there is no `set_state` that accepts an arbitrary variant —
/// each transition is its own named method so illegal transitions do not
/// typecheck.
///
/// ```text
/// IDLE  --(emulator, master, START write)-->        PENDING
/// PENDING --(network, master, broadcast)-->         SENT_DATA
/// IDLE  --(network, slave, got TransferStart)-->     GOT_START
/// GOT_START --(emulator, slave, broadcast own data)--> SENT_DATA
/// SENT_DATA --(network, all data in)-->               FINISHED
/// FINISHED --(emulator, wrote SIOMULTI + IRQ)-->      IDLE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Pending,
    GotStart,
    SentData,
    Finished,
}

/// Per-round scratch state: the words collected this round and which
/// peers' words are still outstanding.
#[derive(Debug, Clone, Copy)]
pub struct TransferRound {
    pub values: SioMulti,
    /// Bit `i` set means peer `i`'s word has not yet arrived this round.
    pub active: u8,
}

impl TransferRound {
    /// Fresh round scratch state for `connected` peers, with `own_id`'s
    /// slot already filled from `own_word` (its own bit is never set in
    /// `active`, matching invariant 3).
    pub fn setup(connected: u8, own_id: u8, own_word: u16) -> TransferRound {
        let mut values = SioMulti::default();
        values.0[own_id as usize] = own_word;

        let all_but_self = mask_of_connected(connected) & !(1 << own_id);
        TransferRound { values, active: all_but_self }
    }

    /// Records peer `id`'s word, clearing its `active` bit. Returns `true`
    /// if this was the last outstanding peer (`active` now `0`).
    pub fn record(&mut self, id: u8, word: u16) -> bool {
        self.values.0[id as usize] = word;
        self.active &= !(1 << id);
        self.active == 0
    }
}

fn mask_of_connected(connected: u8) -> u8 {
    if connected >= 8 { 0xFF } else { (1u16 << connected) as u8 - 1 }
}

impl TransferState {
    /// IDLE -> PENDING. Master emulator thread, guest wrote `SIOCNT.START=1`.
    pub fn to_pending(self) -> Option<TransferState> {
        matches!(self, TransferState::Idle).then_some(TransferState::Pending)
    }

    /// PENDING -> SENT_DATA. Network thread, after broadcasting
    /// TransferStart and its own TransferData.
    pub fn pending_to_sent_data(self) -> Option<TransferState> {
        matches!(self, TransferState::Pending).then_some(TransferState::SentData)
    }

    /// IDLE -> GOT_START. Network thread (slave), TransferStart received.
    pub fn to_got_start(self) -> Option<TransferState> {
        matches!(self, TransferState::Idle).then_some(TransferState::GotStart)
    }

    /// GOT_START -> SENT_DATA. Emulator thread (slave), own data broadcast.
    pub fn got_start_to_sent_data(self) -> Option<TransferState> {
        matches!(self, TransferState::GotStart).then_some(TransferState::SentData)
    }

    /// SENT_DATA -> FINISHED. Network thread, all peers' data received.
    pub fn to_finished(self) -> Option<TransferState> {
        matches!(self, TransferState::SentData).then_some(TransferState::Finished)
    }

    /// FINISHED -> IDLE. Emulator thread, after SIOMULTI write + IRQ.
    pub fn to_idle(self) -> Option<TransferState> {
        matches!(self, TransferState::Finished).then_some(TransferState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_round_transition_chain_is_legal() {
        let s = TransferState::Idle;
        let s = s.to_pending().unwrap();
        let s = s.pending_to_sent_data().unwrap();
        let s = s.to_finished().unwrap();
        let s = s.to_idle().unwrap();
        assert_eq!(s, TransferState::Idle);
    }

    #[test]
    fn slave_round_transition_chain_is_legal() {
        let s = TransferState::Idle;
        let s = s.to_got_start().unwrap();
        let s = s.got_start_to_sent_data().unwrap();
        let s = s.to_finished().unwrap();
        let s = s.to_idle().unwrap();
        assert_eq!(s, TransferState::Idle);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(TransferState::Idle.pending_to_sent_data().is_none());
        assert!(TransferState::Pending.to_got_start().is_none());
        assert!(TransferState::SentData.to_pending().is_none());
        assert!(TransferState::Finished.to_finished().is_none());
    }

    #[test]
    fn round_finishes_only_once_every_peer_has_reported() {
        let mut round = TransferRound::setup(3, 0, 0x1111);
        assert_eq!(round.values.0, [0x1111, 0xFFFF, 0xFFFF, 0xFFFF]);
        assert!(!round.record(1, 0x2222));
        assert!(round.record(2, 0x3333));
        assert_eq!(round.values.0, [0x1111, 0x2222, 0x3333, 0xFFFF]);
    }

    #[test]
    fn two_node_round_matches_scenario_one() {
        let mut master = TransferRound::setup(2, 0, 0x1111);
        assert!(master.record(1, 0x2222));
        assert_eq!(master.values.0, [0x1111, 0x2222, 0xFFFF, 0xFFFF]);

        let mut slave = TransferRound::setup(2, 1, 0x2222);
        assert!(slave.record(0, 0x1111));
        assert_eq!(slave.values.0, [0x1111, 0x2222, 0xFFFF, 0xFFFF]);
    }
}
