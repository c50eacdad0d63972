//! Membership manager: tracks the group's members and views.
//!
//! Keeps members in join order, assigns view ids, and detects silent
//! members based on missed heartbeats. Owned by the fabric; every
//! mutation that changes the member list yields the new `View`.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::channel::{Address, View};

/// Status of a member in the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Alive,
    /// No heartbeat within the suspect timeout; removed on the next reap.
    Suspected,
}

/// In-memory view of a group member.
#[derive(Debug, Clone)]
pub struct Member {
    pub address: Address,
    pub status: MemberStatus,
    pub joined_view: u64,
    pub last_heartbeat: Instant,
}

/// Manages group membership state.
pub struct MembershipManager {
    members: Vec<Member>,
    view_id: u64,
    /// Silence after which a member is suspected.
    suspect_timeout: Duration,
}

impl MembershipManager {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            view_id: 0,
            suspect_timeout: Duration::from_secs(10),
        }
    }

    /// Set the missed-heartbeat suspicion timeout.
    pub fn with_suspect_timeout(mut self, timeout: Duration) -> Self {
        self.suspect_timeout = timeout;
        self
    }

    /// Current view.
    pub fn view(&self) -> View {
        View {
            id: self.view_id,
            members: self.members.iter().map(|m| m.address.clone()).collect(),
        }
    }

    /// Add a member at the end of the view. Joining twice is a no-op.
    pub fn join(&mut self, address: Address) -> View {
        if self.members.iter().any(|m| m.address == address) {
            debug!(%address, "member already joined");
            return self.view();
        }
        self.view_id += 1;
        self.members.push(Member {
            address: address.clone(),
            status: MemberStatus::Alive,
            joined_view: self.view_id,
            last_heartbeat: Instant::now(),
        });
        info!(%address, view = self.view_id, "member joined group");
        self.view()
    }

    /// Record a heartbeat. Returns false for unknown members.
    pub fn heartbeat(&mut self, address: &Address) -> bool {
        match self.members.iter_mut().find(|m| &m.address == address) {
            Some(member) => {
                member.last_heartbeat = Instant::now();
                member.status = MemberStatus::Alive;
                true
            }
            None => {
                warn!(%address, "heartbeat from unknown member");
                false
            }
        }
    }

    /// Remove a member. Returns the new view if it was present.
    pub fn leave(&mut self, address: &Address) -> Option<View> {
        let before = self.members.len();
        self.members.retain(|m| &m.address != address);
        if self.members.len() == before {
            return None;
        }
        self.view_id += 1;
        info!(%address, view = self.view_id, "member left group");
        Some(self.view())
    }

    /// Members with their computed status.
    pub fn list_members(&self) -> Vec<Member> {
        self.members
            .iter()
            .map(|m| Member {
                status: self.status_of(m),
                ..m.clone()
            })
            .collect()
    }

    pub fn get_member(&self, address: &Address) -> Option<Member> {
        self.members
            .iter()
            .find(|m| &m.address == address)
            .map(|m| Member {
                status: self.status_of(m),
                ..m.clone()
            })
    }

    /// Remove every suspected member.
    ///
    /// Returns the removed addresses and, if any were removed, the new view.
    pub fn reap_suspects(&mut self) -> (Vec<Address>, Option<View>) {
        let reaped: Vec<Address> = self
            .list_members()
            .into_iter()
            .filter(|m| m.status == MemberStatus::Suspected)
            .map(|m| m.address)
            .collect();
        if reaped.is_empty() {
            return (reaped, None);
        }
        self.members.retain(|m| !reaped.contains(&m.address));
        self.view_id += 1;
        for address in &reaped {
            warn!(%address, view = self.view_id, "reaped suspected member");
        }
        (reaped, Some(self.view()))
    }

    /// Count of alive members.
    pub fn alive_count(&self) -> usize {
        self.list_members()
            .iter()
            .filter(|m| m.status == MemberStatus::Alive)
            .count()
    }

    fn status_of(&self, member: &Member) -> MemberStatus {
        if member.last_heartbeat.elapsed() > self.suspect_timeout {
            MemberStatus::Suspected
        } else {
            MemberStatus::Alive
        }
    }
}

impl Default for MembershipManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(name: &str) -> Address {
        Address::new(name)
    }

    #[test]
    fn join_appends_in_order() {
        let mut mgr = MembershipManager::new();
        mgr.join(addr("a"));
        let view = mgr.join(addr("b"));

        assert_eq!(view.id, 2);
        assert_eq!(view.members, vec![addr("a"), addr("b")]);
        assert_eq!(view.coordinator(), Some(&addr("a")));
    }

    #[test]
    fn join_twice_keeps_view() {
        let mut mgr = MembershipManager::new();
        mgr.join(addr("a"));
        let view = mgr.join(addr("a"));
        assert_eq!(view.id, 1);
        assert_eq!(view.members.len(), 1);
    }

    #[test]
    fn leave_promotes_next_oldest() {
        let mut mgr = MembershipManager::new();
        mgr.join(addr("a"));
        mgr.join(addr("b"));
        mgr.join(addr("c"));

        let view = mgr.leave(&addr("a")).unwrap();
        assert_eq!(view.coordinator(), Some(&addr("b")));
        assert!(mgr.leave(&addr("a")).is_none());
    }

    #[test]
    fn heartbeat_unknown_member_returns_false() {
        let mut mgr = MembershipManager::new();
        assert!(!mgr.heartbeat(&addr("ghost")));
    }

    #[test]
    fn silent_member_is_suspected_and_reaped() {
        let mut mgr = MembershipManager::new().with_suspect_timeout(Duration::from_millis(0));
        mgr.join(addr("a"));
        std::thread::sleep(Duration::from_millis(2));

        assert_eq!(mgr.get_member(&addr("a")).unwrap().status, MemberStatus::Suspected);
        let (reaped, view) = mgr.reap_suspects();
        assert_eq!(reaped, vec![addr("a")]);
        assert!(view.unwrap().members.is_empty());
    }

    #[test]
    fn heartbeat_keeps_member_alive() {
        let mut mgr = MembershipManager::new().with_suspect_timeout(Duration::from_secs(60));
        mgr.join(addr("a"));
        mgr.join(addr("b"));
        assert!(mgr.heartbeat(&addr("a")));

        let (reaped, view) = mgr.reap_suspects();
        assert!(reaped.is_empty());
        assert!(view.is_none());
        assert_eq!(mgr.alive_count(), 2);
    }
}
