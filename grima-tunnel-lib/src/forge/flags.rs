//! The nine-bit TCP flag record and the cyclic iterator that seeds each
//! outgoing synthetic segment.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;

/// One flag record: the full nine-bit TCP flag tuple, NS included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
    pub ns: bool,
}

impl TcpFlags {
    /// Bit layout matches the TCP header (and `pnet::packet::tcp::TcpFlags`):
    /// FIN is bit 0, NS is bit 8.
    pub fn bits(&self) -> u16 {
        u16::from(self.fin)
            | u16::from(self.syn) << 1
            | u16::from(self.rst) << 2
            | u16::from(self.psh) << 3
            | u16::from(self.ack) << 4
            | u16::from(self.urg) << 5
            | u16::from(self.ece) << 6
            | u16::from(self.cwr) << 7
            | u16::from(self.ns) << 8
    }

    pub fn from_bits(bits: u16) -> Self {
        Self {
            fin: bits & 0x001 != 0,
            syn: bits & 0x002 != 0,
            rst: bits & 0x004 != 0,
            psh: bits & 0x008 != 0,
            ack: bits & 0x010 != 0,
            urg: bits & 0x020 != 0,
            ece: bits & 0x040 != 0,
            cwr: bits & 0x080 != 0,
            ns: bits & 0x100 != 0,
        }
    }
}

/// Cyclic flag sequence shared between senders; advancing never blocks and
/// has no terminal state.
#[derive(Debug)]
pub struct FlagIter {
    items: Vec<TcpFlags>,
    cursor: AtomicUsize,
}

impl FlagIter {
    /// Returns `None` for an empty list; a live iterator always holds at
    /// least one record.
    pub fn new(items: Vec<TcpFlags>) -> Option<Self> {
        if items.is_empty() {
            return None;
        }
        Some(Self { items, cursor: AtomicUsize::new(0) })
    }

    pub fn next(&self) -> TcpFlags {
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.items[n % self.items.len()]
    }
}

/// The default flag sequence plus per-peer overrides learned from TCPF
/// frames. Overrides are installed rarely and read on every packet, so the
/// map is swapped wholesale instead of locked.
pub(crate) struct FlagBook {
    default: FlagIter,
    overrides: arc_swap::ArcSwap<std::collections::HashMap<u64, std::sync::Arc<FlagIter>>>,
}

impl FlagBook {
    pub fn new(default: FlagIter) -> Self {
        Self {
            default,
            overrides: arc_swap::ArcSwap::from_pointee(std::collections::HashMap::new()),
        }
    }

    /// Draw the next flags for the peer with this fingerprint.
    pub fn next(&self, fingerprint: u64) -> TcpFlags {
        match self.overrides.load().get(&fingerprint) {
            Some(iter) => iter.next(),
            None => self.default.next(),
        }
    }

    /// Install an override; draws for this peer start from the new list's
    /// first record. Empty lists are ignored, and overrides are never
    /// removed.
    pub fn install(&self, fingerprint: u64, list: Vec<TcpFlags>) {
        let Some(iter) = FlagIter::new(list) else {
            return;
        };
        let iter = std::sync::Arc::new(iter);
        self.overrides.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(fingerprint, iter.clone());
            next
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(syn: bool, ack: bool) -> TcpFlags {
        TcpFlags { syn, ack, ..TcpFlags::default() }
    }

    #[test]
    fn iteration_is_cyclic() {
        let list = vec![f(true, false), f(false, true)];
        let iter = FlagIter::new(list.clone()).unwrap();
        for n in 0..7 {
            assert_eq!(iter.next(), list[n % list.len()]);
        }
    }

    #[test]
    fn single_entry_repeats() {
        let iter = FlagIter::new(vec![f(true, true)]).unwrap();
        assert_eq!(iter.next(), iter.next());
    }

    #[test]
    fn empty_list_is_rejected() {
        assert!(FlagIter::new(Vec::new()).is_none());
    }

    #[test]
    fn override_takes_effect_from_its_first_record() {
        let book = FlagBook::new(FlagIter::new(vec![f(true, false), f(false, true)]).unwrap());
        let peer = 0xdead_beef_u64;

        // Draws before the install follow the default sequence.
        assert_eq!(book.next(peer), f(true, false));
        assert_eq!(book.next(peer), f(false, true));

        let rst = TcpFlags { rst: true, ..TcpFlags::default() };
        book.install(peer, vec![f(true, false), rst]);
        assert_eq!(book.next(peer), f(true, false));
        assert_eq!(book.next(peer), rst);
        assert_eq!(book.next(peer), f(true, false));

        // Other peers keep drawing from the default sequence where it left off.
        assert_eq!(book.next(0x1234), f(true, false));
    }

    #[test]
    fn empty_override_is_ignored() {
        let book = FlagBook::new(FlagIter::new(vec![f(true, true)]).unwrap());
        book.install(7, Vec::new());
        assert_eq!(book.next(7), f(true, true));
    }

    #[test]
    fn bits_round_trip() {
        let all = TcpFlags {
            fin: true,
            syn: true,
            rst: true,
            psh: true,
            ack: true,
            urg: true,
            ece: true,
            cwr: true,
            ns: true,
        };
        assert_eq!(all.bits(), 0x1FF);
        assert_eq!(TcpFlags::from_bits(all.bits()), all);
        let syn = f(true, false);
        assert_eq!(TcpFlags::from_bits(syn.bits()), syn);
    }
}
