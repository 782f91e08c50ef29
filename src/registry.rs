//! Connection registries.
//!
//! `ConnectionRegistry` is injected into every server and client engine. It
//! tracks all live connections, the client-side connected and closed sets,
//! and the IP, user, group and token bindings applications use to address
//! connections. Bindings survive a client reconnect; they are dropped only
//! when the connection is removed.

use std::{
    collections::{BTreeSet, HashSet},
    hash::Hash,
    net::IpAddr,
};

use dashmap::DashMap;

use crate::{
    connection::{Connection, ConnectionId},
    packet::Packet,
};

/// Bindings held by one connection, mirrored in the registry maps.
#[derive(Debug, Default)]
pub(crate) struct Bindings {
    pub(crate) ip: Option<IpAddr>,
    pub(crate) user: Option<String>,
    pub(crate) token: Option<String>,
    pub(crate) groups: BTreeSet<String>,
}

type MultiMap<K> = DashMap<K, HashSet<ConnectionId>>;

fn insert_multi<K: Eq + Hash>(map: &MultiMap<K>, key: K, id: ConnectionId) {
    map.entry(key).or_default().insert(id);
}

fn remove_multi<K: Eq + Hash>(map: &MultiMap<K>, key: &K, id: ConnectionId) {
    if let Some(mut ids) = map.get_mut(key) {
        ids.remove(&id);
    }
    map.remove_if(key, |_, ids| ids.is_empty());
}

/// Concurrent registry of connections and their bindings.
pub struct ConnectionRegistry<P: Packet> {
    all: DashMap<ConnectionId, Connection<P>>,
    connected: DashMap<ConnectionId, Connection<P>>,
    closed: DashMap<ConnectionId, Connection<P>>,
    ips: MultiMap<IpAddr>,
    users: MultiMap<String>,
    groups: MultiMap<String>,
    tokens: MultiMap<String>,
}

impl<P: Packet> Default for ConnectionRegistry<P> {
    fn default() -> Self {
        Self {
            all: DashMap::new(),
            connected: DashMap::new(),
            closed: DashMap::new(),
            ips: DashMap::new(),
            users: DashMap::new(),
            groups: DashMap::new(),
            tokens: DashMap::new(),
        }
    }
}

impl<P: Packet> ConnectionRegistry<P> {
    /// Look up a connection by identifier.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Connection<P>> {
        self.all.get(&id).map(|c| c.clone())
    }

    /// Number of registered connections, active or awaiting reconnect.
    #[must_use]
    pub fn len(&self) -> usize { self.all.len() }

    /// Whether no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.all.is_empty() }

    /// Number of connections in the connected set.
    #[must_use]
    pub fn connected_count(&self) -> usize { self.connected.len() }

    /// Number of closed client connections awaiting reconnection.
    #[must_use]
    pub fn closed_count(&self) -> usize { self.closed.len() }

    /// Snapshot of every registered connection.
    #[must_use]
    pub fn all(&self) -> Vec<Connection<P>> { self.all.iter().map(|c| c.clone()).collect() }

    /// Snapshot of the connected set.
    #[must_use]
    pub fn connected(&self) -> Vec<Connection<P>> {
        self.connected.iter().map(|c| c.clone()).collect()
    }

    /// Snapshot of the closed set.
    #[must_use]
    pub fn closed(&self) -> Vec<Connection<P>> { self.closed.iter().map(|c| c.clone()).collect() }

    /// Connections from `ip`.
    #[must_use]
    pub fn by_ip(&self, ip: IpAddr) -> Vec<Connection<P>> { self.collect(&self.ips, &ip) }

    /// Connected connections whose peer address is `ip`, bound or not.
    #[must_use]
    pub fn by_peer_ip(&self, ip: IpAddr) -> Vec<Connection<P>> {
        self.connected
            .iter()
            .filter(|c| c.peer_addr().is_some_and(|addr| addr.ip() == ip))
            .map(|c| c.clone())
            .collect()
    }

    /// Connections bound to `user`.
    #[must_use]
    pub fn by_user(&self, user: &str) -> Vec<Connection<P>> {
        self.collect(&self.users, &user.to_owned())
    }

    /// Connections bound to `group`.
    #[must_use]
    pub fn by_group(&self, group: &str) -> Vec<Connection<P>> {
        self.collect(&self.groups, &group.to_owned())
    }

    /// Connections bound to `token`.
    #[must_use]
    pub fn by_token(&self, token: &str) -> Vec<Connection<P>> {
        self.collect(&self.tokens, &token.to_owned())
    }

    /// Number of connections bound to `group`.
    #[must_use]
    pub fn group_size(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, |ids| ids.len())
    }

    fn collect<K: Eq + Hash>(&self, map: &MultiMap<K>, key: &K) -> Vec<Connection<P>> {
        let ids: Vec<ConnectionId> = map
            .get(key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.get(id)).collect()
    }

    /// Bind `conn` to `user`, replacing any previous user binding.
    ///
    /// Binding calls on a removed connection are ignored. The removed flag
    /// is set before `remove` takes the bindings, and is checked here under
    /// the same lock, so no entry outlives the connection.
    pub fn bind_user(&self, conn: &Connection<P>, user: impl Into<String>) {
        let user = user.into();
        let mut bindings = conn.bindings().lock();
        if conn.is_removed() {
            return;
        }
        if let Some(old) = bindings.user.replace(user.clone()) {
            remove_multi(&self.users, &old, conn.id());
        }
        insert_multi(&self.users, user, conn.id());
    }

    /// Drop the user binding of `conn`.
    pub fn unbind_user(&self, conn: &Connection<P>) {
        if let Some(old) = conn.bindings().lock().user.take() {
            remove_multi(&self.users, &old, conn.id());
        }
    }

    /// Bind `conn` to `token`, replacing any previous token binding.
    pub fn bind_token(&self, conn: &Connection<P>, token: impl Into<String>) {
        let token = token.into();
        let mut bindings = conn.bindings().lock();
        if conn.is_removed() {
            return;
        }
        if let Some(old) = bindings.token.replace(token.clone()) {
            remove_multi(&self.tokens, &old, conn.id());
        }
        insert_multi(&self.tokens, token, conn.id());
    }

    /// Drop the token binding of `conn`.
    pub fn unbind_token(&self, conn: &Connection<P>) {
        if let Some(old) = conn.bindings().lock().token.take() {
            remove_multi(&self.tokens, &old, conn.id());
        }
    }

    /// Add `conn` to `group`.
    pub fn bind_group(&self, conn: &Connection<P>, group: impl Into<String>) {
        let group = group.into();
        let mut bindings = conn.bindings().lock();
        if conn.is_removed() {
            return;
        }
        bindings.groups.insert(group.clone());
        insert_multi(&self.groups, group, conn.id());
    }

    /// Remove `conn` from `group`.
    pub fn unbind_group(&self, conn: &Connection<P>, group: &str) {
        if conn.bindings().lock().groups.remove(group) {
            remove_multi(&self.groups, &group.to_owned(), conn.id());
        }
    }

    /// Remove `conn` from every group.
    pub fn unbind_all_groups(&self, conn: &Connection<P>) {
        let groups = std::mem::take(&mut conn.bindings().lock().groups);
        for group in groups {
            remove_multi(&self.groups, &group, conn.id());
        }
    }

    pub(crate) fn bind_ip(&self, conn: &Connection<P>) {
        let Some(ip) = conn.peer_addr().map(|addr| addr.ip()) else {
            return;
        };
        let mut bindings = conn.bindings().lock();
        if conn.is_removed() {
            return;
        }
        if let Some(old) = bindings.ip.replace(ip) {
            remove_multi(&self.ips, &old, conn.id());
        }
        insert_multi(&self.ips, ip, conn.id());
    }

    pub(crate) fn mark_connected(&self, conn: &Connection<P>) {
        self.all.insert(conn.id(), conn.clone());
        self.closed.remove(&conn.id());
        self.connected.insert(conn.id(), conn.clone());
    }

    pub(crate) fn mark_closed(&self, conn: &Connection<P>) {
        self.all.insert(conn.id(), conn.clone());
        self.connected.remove(&conn.id());
        self.closed.insert(conn.id(), conn.clone());
    }

    /// Purge `conn` from every map.
    pub(crate) fn remove(&self, conn: &Connection<P>) {
        let id = conn.id();
        self.all.remove(&id);
        self.connected.remove(&id);
        self.closed.remove(&id);
        let bindings = std::mem::take(&mut *conn.bindings().lock());
        if let Some(ip) = bindings.ip {
            remove_multi(&self.ips, &ip, id);
        }
        if let Some(user) = bindings.user {
            remove_multi(&self.users, &user, id);
        }
        if let Some(token) = bindings.token {
            remove_multi(&self.tokens, &token, id);
        }
        for group in bindings.groups {
            remove_multi(&self.groups, &group, id);
        }
    }

    fn fan_out(targets: Vec<Connection<P>>, packet: &P) -> usize
    where
        P: Clone,
    {
        targets
            .into_iter()
            .filter(|conn| conn.send(packet.clone()))
            .count()
    }

    /// Send `packet` to every connection bound to `user`. Returns how many
    /// connections accepted it.
    pub fn send_to_user(&self, user: &str, packet: &P) -> usize
    where
        P: Clone,
    {
        Self::fan_out(self.by_user(user), packet)
    }

    /// Send `packet` to every member of `group`.
    pub fn send_to_group(&self, group: &str, packet: &P) -> usize
    where
        P: Clone,
    {
        Self::fan_out(self.by_group(group), packet)
    }

    /// Send `packet` to every connection bound to `token`.
    pub fn send_to_token(&self, token: &str, packet: &P) -> usize
    where
        P: Clone,
    {
        Self::fan_out(self.by_token(token), packet)
    }

    /// Send `packet` to every connection from `ip`.
    pub fn send_to_ip(&self, ip: IpAddr, packet: &P) -> usize
    where
        P: Clone,
    {
        Self::fan_out(self.by_ip(ip), packet)
    }

    /// Send `packet` to every connected connection.
    pub fn broadcast(&self, packet: &P) -> usize
    where
        P: Clone,
    {
        Self::fan_out(self.connected(), packet)
    }

    /// Close every connection bound to `user`.
    pub fn close_user(&self, user: &str, remark: &str) -> usize {
        Self::close_all(self.by_user(user), remark)
    }

    /// Close every member of `group`.
    pub fn close_group(&self, group: &str, remark: &str) -> usize {
        Self::close_all(self.by_group(group), remark)
    }

    /// Close every connection from `ip`.
    pub fn close_ip(&self, ip: IpAddr, remark: &str) -> usize {
        Self::close_all(self.by_ip(ip), remark)
    }

    fn close_all(targets: Vec<Connection<P>>, remark: &str) -> usize {
        let count = targets.len();
        for conn in targets {
            conn.close(remark);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use rstest::{fixture, rstest};

    use crate::{
        codec::{Frame, LengthPrefixedCodec},
        connection::{Connection, Role},
        engine::test_engine,
    };

    #[fixture]
    fn conns() -> (Connection<Frame>, Connection<Frame>) {
        let engine = test_engine(LengthPrefixedCodec::default(), Role::Server);
        let peer: SocketAddr = "10.1.1.1:4000".parse().expect("addr");
        let a = Connection::detached(&engine, Some(peer));
        let b = Connection::detached(&engine, Some("10.1.1.1:4001".parse().expect("addr")));
        engine.registry.mark_connected(&a);
        engine.registry.mark_connected(&b);
        (a, b)
    }

    #[rstest]
    fn user_binding_replaces_previous(conns: (Connection<Frame>, Connection<Frame>)) {
        let (a, _) = conns;
        a.bind_user("alice");
        a.bind_user("bob");
        let registry = a.registry();
        assert!(registry.by_user("alice").is_empty());
        assert_eq!(registry.by_user("bob").len(), 1);
        assert_eq!(a.user().as_deref(), Some("bob"));
    }

    #[rstest]
    fn groups_collect_members(conns: (Connection<Frame>, Connection<Frame>)) {
        let (a, b) = conns;
        a.bind_group("room");
        b.bind_group("room");
        b.bind_group("lobby");
        let registry = a.registry();
        assert_eq!(registry.group_size("room"), 2);
        a.unbind_group("room");
        assert_eq!(registry.group_size("room"), 1);
        assert_eq!(registry.by_group("lobby")[0].id(), b.id());
    }

    #[rstest]
    fn ip_binding_follows_peer_address(conns: (Connection<Frame>, Connection<Frame>)) {
        let (a, b) = conns;
        let registry = a.registry();
        registry.bind_ip(&a);
        registry.bind_ip(&b);
        let ip = a.peer_addr().expect("peer").ip();
        assert_eq!(registry.by_ip(ip).len(), 2);
    }

    #[rstest]
    fn peer_ip_lookup_ignores_bindings(conns: (Connection<Frame>, Connection<Frame>)) {
        let (a, _) = conns;
        let registry = a.registry();
        let ip = a.peer_addr().expect("peer").ip();
        assert!(registry.by_ip(ip).is_empty());
        let found = registry.by_peer_ip(ip);
        assert!(found.iter().any(|c| c.id() == a.id()));
    }

    #[rstest]
    fn removal_drops_every_binding(conns: (Connection<Frame>, Connection<Frame>)) {
        let (a, _) = conns;
        let registry = a.registry().clone();
        a.bind_user("alice");
        a.bind_token("t-1");
        a.bind_group("room");
        registry.bind_ip(&a);
        registry.remove(&a);
        assert!(registry.get(a.id()).is_none());
        assert!(registry.by_user("alice").is_empty());
        assert!(registry.by_token("t-1").is_empty());
        assert_eq!(registry.group_size("room"), 0);
        assert_eq!(registry.len(), 1);
    }

    #[rstest]
    fn removed_connection_cannot_be_bound(conns: (Connection<Frame>, Connection<Frame>)) {
        let (a, _) = conns;
        let registry = a.registry().clone();
        a.remove("gone");
        a.bind_user("alice");
        a.bind_token("t-1");
        a.bind_group("room");
        registry.bind_ip(&a);
        assert!(registry.by_user("alice").is_empty());
        assert!(registry.by_token("t-1").is_empty());
        assert_eq!(registry.group_size("room"), 0);
        assert!(registry.by_ip(a.peer_addr().expect("peer").ip()).is_empty());
        assert_eq!(a.user(), None);
    }

    #[rstest]
    fn closed_set_tracks_parked_connections(conns: (Connection<Frame>, Connection<Frame>)) {
        let (a, _) = conns;
        let registry = a.registry();
        registry.mark_closed(&a);
        assert_eq!(registry.closed_count(), 1);
        assert_eq!(registry.connected_count(), 1);
        registry.mark_connected(&a);
        assert_eq!(registry.closed_count(), 0);
        assert_eq!(registry.connected_count(), 2);
    }
}
