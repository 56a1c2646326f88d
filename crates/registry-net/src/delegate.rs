//! Callbacks a transport makes into the application

/// Application hooks invoked by the [`Transport`](crate::Transport).
///
/// Calls arrive from arbitrary tasks, possibly concurrently, and payloads
/// may be duplicated or reordered.
pub trait Delegate: Send + Sync + 'static {
    /// Metadata advertised for the local node, at most `limit` bytes
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A broadcast payload arrived from a peer
    fn notify_msg(&self, msg: &[u8]);

    /// Pending broadcasts to piggyback on the next gossip round.
    /// Each message costs `overhead` plus its length against `limit`.
    fn broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Full local state for a push/pull exchange
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Full state received from a peer during push/pull
    fn merge_remote_state(&self, buf: &[u8], join: bool);

    /// Membership changed; `num_members` includes the local node
    fn notify_members(&self, _num_members: usize) {}
}
