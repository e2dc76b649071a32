use super::lease::{LEASE_KIND, Lease, LeaseFactory, LeasePool, LeaseResolver};
use crate::error::PersistError;
use crate::pickle::{PickleFactory, PickleResolver};
use crate::types::LiveHandle;
use std::sync::Arc;

#[test]
fn acquire_and_release() {
  let pool = LeasePool::new();
  let a = pool.acquire("db");
  let b = pool.acquire("db");
  assert_ne!(a.id, b.id);
  assert_eq!(pool.held_count(), 2);
  assert!(pool.release(&a));
  assert!(!pool.release(&a));
  assert!(pool.is_held("db"));
  assert!(pool.release(&b));
  assert!(!pool.is_held("db"));
}

#[test]
fn factory_only_writes_leases() {
  let lease = Lease {
    resource: "db".into(),
    id: 7,
  };
  let pickle = LeaseFactory.writes(&LiveHandle::new(lease.clone())).unwrap();
  assert_eq!(pickle.kind, LEASE_KIND);
  assert_eq!(pickle.data["id"], 7);

  #[derive(Debug)]
  struct Other;
  impl crate::types::LiveResource for Other {
    fn kind(&self) -> &'static str {
      "other"
    }
    fn describe(&self) -> String {
      "other".into()
    }
    fn as_any(&self) -> &dyn std::any::Any {
      self
    }
  }
  assert!(LeaseFactory.writes(&LiveHandle::new(Other)).is_none());
}

#[tokio::test]
async fn resolver_reattaches_and_fails_offline() {
  let pool = Arc::new(LeasePool::new());
  let resolver = LeaseResolver::new(pool.clone());
  let pickle = LeaseFactory
    .writes(&LiveHandle::new(Lease {
      resource: "db".into(),
      id: 41,
    }))
    .unwrap();

  let live = resolver.resolve(&pickle).await.unwrap();
  assert_eq!(live.downcast_ref::<Lease>().unwrap().id, 41);
  assert!(pool.is_held("db"));
  assert!(pool.acquire("db").id > 41);

  pool.set_offline(true);
  let err = resolver.resolve(&pickle).await.unwrap_err();
  assert!(matches!(err, PersistError::Rehydrate { ref kind, .. } if kind == LEASE_KIND));
}
