//! Puffer für Remote-ICE-Candidates
//!
//! Candidates können vor der Remote Description eintreffen. Bis diese gesetzt
//! ist (und während des anschließenden Abarbeitens) werden sie hier in
//! Ankunftsreihenfolge gesammelt.

use super::peer::IceCandidate;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingRemote,
    Draining,
    Ready,
}

/// Ergebnis von [`IceCandidateQueue::admit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Queued,
    Apply(IceCandidate),
}

#[derive(Debug)]
pub struct IceCandidateQueue {
    phase: Phase,
    pending: VecDeque<IceCandidate>,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingRemote,
            pending: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remote Description gesetzt und Puffer leer?
    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    pub fn admit(&mut self, candidate: IceCandidate) -> Admission {
        match self.phase {
            Phase::Ready => Admission::Apply(candidate),
            Phase::AwaitingRemote | Phase::Draining => {
                self.pending.push_back(candidate);
                Admission::Queued
            }
        }
    }

    /// Nach dem Setzen der Remote Description aufrufen
    pub fn begin_drain(&mut self) {
        self.phase = Phase::Draining;
    }

    /// Nächster gepufferter Candidate; `None` beendet das Abarbeiten
    pub fn next_for_drain(&mut self) -> Option<IceCandidate> {
        if self.phase != Phase::Draining {
            return None;
        }
        let next = self.pending.pop_front();
        if next.is_none() {
            self.phase = Phase::Ready;
        }
        next
    }

    pub fn reset(&mut self) {
        self.phase = Phase::AwaitingRemote;
        self.pending.clear();
    }
}

impl Default for IceCandidateQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 UDP 1 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn test_candidates_wait_for_remote_description() {
        let mut queue = IceCandidateQueue::new();
        assert_eq!(queue.admit(candidate(1)), Admission::Queued);
        assert_eq!(queue.admit(candidate(2)), Admission::Queued);
        assert_eq!(queue.next_for_drain(), None);
        assert_eq!(queue.len(), 2);

        queue.begin_drain();
        assert_eq!(queue.next_for_drain(), Some(candidate(1)));
        assert_eq!(queue.next_for_drain(), Some(candidate(2)));

        // Während des Abarbeitens eintreffende Candidates kommen hinten dran
        assert_eq!(queue.admit(candidate(3)), Admission::Queued);
        assert_eq!(queue.next_for_drain(), Some(candidate(3)));
        assert_eq!(queue.next_for_drain(), None);
        assert!(queue.is_ready());

        assert_eq!(queue.admit(candidate(4)), Admission::Apply(candidate(4)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reset_discards_pending() {
        let mut queue = IceCandidateQueue::new();
        queue.begin_drain();
        assert_eq!(queue.next_for_drain(), None);
        assert!(queue.is_ready());

        queue.reset();
        assert!(!queue.is_ready());
        assert_eq!(queue.admit(candidate(1)), Admission::Queued);
        queue.reset();
        assert_eq!(queue.len(), 0);
    }
}
