//! Per-key conflict index and speculative-read checksums.

use serde::{Deserialize, Serialize};

use super::types::{Command, CommandId};

/// Output of the per-key checksum accumulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct SHash(pub [u8; 32]);

/// Compare two checksum vectors element-wise.
pub fn shashes_eq(a: &[SHash], b: &[SHash]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

/// Recent conflicting commands for one key.
///
/// Keeps the last write and the reads issued since it: a new write conflicts
/// with all of them, a new read only with the write. Older entries are
/// irrelevant because the last write already depends on them transitively.
#[derive(Debug, Default)]
pub struct KeyInfo {
    last_write: Option<CommandId>,
    reads_since_write: Vec<CommandId>,
}

impl KeyInfo {
    /// Commands a new `cmd` on this key must depend on.
    pub fn conflict_cmds(&self, cmd: &Command) -> Vec<CommandId> {
        let mut dep = Vec::new();
        if let Some(write) = self.last_write {
            dep.push(write);
        }
        if !cmd.is_read() {
            dep.extend(self.reads_since_write.iter().copied());
        }
        dep
    }

    /// Record `cmd` as the newest command touching this key.
    pub fn add(&mut self, cmd: &Command, cmd_id: CommandId) {
        if cmd.is_read() {
            self.reads_since_write.push(cmd_id);
        } else {
            self.last_write = Some(cmd_id);
            self.reads_since_write.clear();
        }
    }
}

/// Order-sensitive checksum chain over the commands that touched a key.
///
/// Replicas that applied the same commands in causally-consistent order
/// produce equal hashes; a follower observing a mismatch against the
/// leader's hashes knows its speculative view diverged.
#[derive(Debug, Default)]
pub struct Checksum {
    cur: SHash,
}

impl Checksum {
    /// Fold `cmd` into the chain and return the new accumulator value.
    pub fn update(&mut self, cmd: &Command, cmd_id: CommandId) -> SHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.cur.0);
        hasher.update(&cmd_id.client_id.to_le_bytes());
        hasher.update(&cmd_id.seq_num.to_le_bytes());
        hasher.update(&[cmd.op as u8]);
        hasher.update(&cmd.key.to_le_bytes());
        hasher.update(&cmd.value);
        self.cur = SHash(*hasher.finalize().as_bytes());
        self.cur
    }

    /// Install an out-of-band corrected hash; subsequent updates chain from
    /// it.
    pub fn correct(&mut self, _cmd_id: CommandId, new_hash: SHash) {
        self.cur = new_hash;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(client: u32, seq: u32) -> CommandId {
        CommandId {
            client_id: client,
            seq_num: seq,
        }
    }

    #[test]
    fn reads_depend_only_on_the_last_write() {
        let mut info = KeyInfo::default();
        let w1 = Command::put(1, b"a".to_vec());
        let r1 = Command::get(1);

        assert!(info.conflict_cmds(&r1).is_empty());
        info.add(&w1, id(1, 1));
        info.add(&r1, id(2, 1));
        info.add(&r1, id(3, 1));

        assert_eq!(info.conflict_cmds(&r1), vec![id(1, 1)]);
        // A write conflicts with the last write and every read after it.
        assert_eq!(
            info.conflict_cmds(&w1),
            vec![id(1, 1), id(2, 1), id(3, 1)]
        );

        // A new write resets the read set.
        info.add(&w1, id(4, 1));
        assert_eq!(info.conflict_cmds(&w1), vec![id(4, 1)]);
    }

    #[test]
    fn checksum_is_order_sensitive_and_deterministic() {
        let w1 = Command::put(1, b"a".to_vec());
        let w2 = Command::put(1, b"b".to_vec());

        let mut one = Checksum::default();
        let mut two = Checksum::default();
        let h1 = one.update(&w1, id(1, 1));
        let h2 = one.update(&w2, id(2, 1));
        assert_ne!(h1, h2);

        // Same commands, same order: equal chain.
        two.update(&w1, id(1, 1));
        assert_eq!(two.update(&w2, id(2, 1)), h2);

        // Different order: divergent chain.
        let mut three = Checksum::default();
        three.update(&w2, id(2, 1));
        assert_ne!(three.update(&w1, id(1, 1)), h2);
    }

    #[test]
    fn correction_rebases_the_chain() {
        let w = Command::put(1, b"a".to_vec());
        let mut stale = Checksum::default();
        let mut fresh = Checksum::default();

        stale.update(&Command::put(1, b"old".to_vec()), id(9, 9));
        let good = fresh.update(&w, id(1, 1));
        assert_ne!(stale.update(&w, id(1, 1)), good);

        // After correction the stale replica chains from the leader's hash.
        stale.correct(id(1, 1), good);
        let w2 = Command::put(1, b"b".to_vec());
        assert_eq!(stale.update(&w2, id(2, 1)), fresh.update(&w2, id(2, 1)));
    }

    #[test]
    fn shash_vector_equality() {
        let a = SHash([1; 32]);
        let b = SHash([2; 32]);
        assert!(shashes_eq(&[a, b], &[a, b]));
        assert!(!shashes_eq(&[a, b], &[b, a]));
        assert!(!shashes_eq(&[a], &[a, b]));
        assert!(shashes_eq(&[], &[]));
    }
}
