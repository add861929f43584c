//! Client connections cached per address.
//!
//! The pool is append-only. Each address gets a slot that is initialized
//! once; concurrent first users of the same address wait on the same
//! handshake instead of opening duplicate connections.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::OnceCell;
use tracing::debug;

type Slot<C> = Arc<OnceCell<Arc<C>>>;

pub struct ConnectionPool<C: ?Sized> {
  connections: RwLock<HashMap<String, Slot<C>>>,
}

impl<C: ?Sized + Send + Sync> ConnectionPool<C> {
  pub fn new() -> Self {
    Self {
      connections: RwLock::new(HashMap::new()),
    }
  }

  /// Get the client for `address`, connecting with `connect` if none exists.
  pub async fn get_or_connect<F, Fut, E>(&self, address: &str, connect: F) -> Result<Arc<C>, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Arc<C>, E>>,
  {
    let slot = self.slot(address);
    slot
      .get_or_try_init(|| async {
        debug!(address = %address, "connection_opening");
        connect().await
      })
      .await
      .cloned()
  }

  /// The client for `address`, if one is connected.
  pub fn get(&self, address: &str) -> Option<Arc<C>> {
    let connections = self.connections.read().unwrap_or_else(PoisonError::into_inner);
    connections.get(address).and_then(|slot| slot.get().cloned())
  }

  pub fn len(&self) -> usize {
    let connections = self.connections.read().unwrap_or_else(PoisonError::into_inner);
    connections.values().filter(|slot| slot.initialized()).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn slot(&self, address: &str) -> Slot<C> {
    // Try read lock first
    {
      let connections = self.connections.read().unwrap_or_else(PoisonError::into_inner);
      if let Some(slot) = connections.get(address) {
        return slot.clone();
      }
    }

    let mut connections = self.connections.write().unwrap_or_else(PoisonError::into_inner);
    connections
      .entry(address.to_string())
      .or_insert_with(|| Arc::new(OnceCell::new()))
      .clone()
  }
}

impl<C: ?Sized + Send + Sync> Default for ConnectionPool<C> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  use super::*;

  #[derive(Debug)]
  struct Client(String);

  #[tokio::test]
  async fn test_same_address_returns_same_client() {
    let pool: ConnectionPool<Client> = ConnectionPool::new();
    let connect = |addr: &'static str| move || async move { Ok::<_, ()>(Arc::new(Client(addr.into()))) };

    let a1 = pool.get_or_connect("tcp://a", connect("tcp://a")).await.unwrap();
    let a2 = pool.get_or_connect("tcp://a", connect("tcp://a")).await.unwrap();
    let b = pool.get_or_connect("tcp://b", connect("tcp://b")).await.unwrap();

    assert!(Arc::ptr_eq(&a1, &a2));
    assert!(!Arc::ptr_eq(&a1, &b));
    assert_eq!(b.0, "tcp://b");
    assert_eq!(pool.len(), 2);
    assert!(pool.get("tcp://c").is_none());
  }

  #[tokio::test]
  async fn test_failed_connect_is_not_cached() {
    let pool: ConnectionPool<Client> = ConnectionPool::new();

    let err = pool
      .get_or_connect("tcp://a", || async { Err::<Arc<Client>, _>("refused") })
      .await;
    assert_eq!(err.unwrap_err(), "refused");
    assert!(pool.is_empty());

    let ok = pool
      .get_or_connect("tcp://a", || async { Ok::<_, &str>(Arc::new(Client("a".into()))) })
      .await;
    assert!(ok.is_ok());
    assert!(pool.get("tcp://a").is_some());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_first_use_connects_once() {
    let pool = Arc::new(ConnectionPool::<Client>::new());
    let connects = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
      .map(|_| {
        let pool = pool.clone();
        let connects = connects.clone();
        tokio::spawn(async move {
          pool
            .get_or_connect("tcp://shared", || async move {
              connects.fetch_add(1, Ordering::SeqCst);
              tokio::time::sleep(Duration::from_millis(20)).await;
              Ok::<_, ()>(Arc::new(Client("shared".into())))
            })
            .await
            .unwrap()
        })
      })
      .collect();

    let clients: Vec<Arc<Client>> = futures::future::join_all(handles)
      .await
      .into_iter()
      .map(|r| r.unwrap())
      .collect();

    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));
  }
}
