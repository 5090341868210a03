//! Write path: per-entity serialization and post-write invalidation.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::cache::{CacheDirectory, ResourceType};
use crate::error::ApiError;
use crate::transport::{Request, Response, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  Create,
  Update,
  Delete,
}

/// One write against the remote service. Lives only for the duration of the call.
#[derive(Debug, Clone)]
pub struct Mutation {
  pub resource: ResourceType,
  pub operation: Operation,
  /// Entity id for updates and deletes. Creates have none.
  pub target: Option<String>,
  pub request: Request,
  /// Resource types to mark stale once the write succeeds.
  pub invalidates: BTreeSet<ResourceType>,
}

impl Mutation {
  fn new(
    resource: ResourceType,
    operation: Operation,
    target: Option<String>,
    request: Request,
  ) -> Self {
    Self {
      resource,
      operation,
      target,
      request,
      invalidates: BTreeSet::from([resource]),
    }
  }

  pub fn create(resource: ResourceType, request: Request) -> Self {
    Self::new(resource, Operation::Create, None, request)
  }

  pub fn update(resource: ResourceType, id: impl Into<String>, request: Request) -> Self {
    Self::new(resource, Operation::Update, Some(id.into()), request)
  }

  pub fn delete(resource: ResourceType, id: impl Into<String>, request: Request) -> Self {
    Self::new(resource, Operation::Delete, Some(id.into()), request)
  }

  /// Also invalidate `others` on success.
  pub fn invalidating(mut self, others: impl IntoIterator<Item = ResourceType>) -> Self {
    self.invalidates.extend(others);
    self
  }
}

type EntityKey = (ResourceType, String);
type SharedOutcome = Shared<BoxFuture<'static, Result<Response, ApiError>>>;

/// Per-entity queue state.
struct Lane {
  /// Sequence number of the newest mutation in the lane.
  tail_seq: u64,
  tail: SharedOutcome,
  /// Set while the newest write is a delete, for coalescing repeats.
  pending_delete: Option<SharedOutcome>,
}

/// Runs writes, one at a time per entity, and invalidates the cache after
/// each successful one.
pub struct MutationCoordinator {
  transport: Arc<Transport>,
  cache: Arc<CacheDirectory>,
  lanes: Arc<Mutex<HashMap<EntityKey, Lane>>>,
  next_seq: Mutex<u64>,
}

impl MutationCoordinator {
  pub fn new(transport: Arc<Transport>, cache: Arc<CacheDirectory>) -> Self {
    Self {
      transport,
      cache,
      lanes: Arc::new(Mutex::new(HashMap::new())),
      next_seq: Mutex::new(0),
    }
  }

  /// Run a mutation.
  ///
  /// Mutations on the same entity reach the server in submission order.
  /// A delete submitted while another delete of the same entity is pending
  /// resolves with that delete's outcome instead of issuing a second request.
  /// Once submitted a mutation runs to completion even if the caller stops
  /// waiting.
  pub async fn mutate(&self, mutation: Mutation) -> Result<Response, ApiError> {
    let outcome = match mutation.target.clone() {
      None => {
        let run = execute(
          Arc::clone(&self.transport),
          Arc::clone(&self.cache),
          mutation,
        )
        .boxed()
        .shared();
        tokio::spawn(run.clone());
        run
      }
      Some(target) => self.enqueue((mutation.resource, target), mutation),
    };

    outcome.await
  }

  /// Number of entities with writes queued or running.
  pub fn pending_entities(&self) -> usize {
    self.lanes.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  fn enqueue(&self, key: EntityKey, mutation: Mutation) -> SharedOutcome {
    let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
    let lane = lanes.get(&key);
    let is_delete = mutation.operation == Operation::Delete;

    if is_delete {
      if let Some(pending) = lane.and_then(|l| l.pending_delete.as_ref()) {
        debug!(resource = %key.0, id = %key.1, "delete already pending, coalescing");
        return pending.clone();
      }
    }

    let seq = {
      let mut next = self.next_seq.lock().unwrap_or_else(|e| e.into_inner());
      *next += 1;
      *next
    };
    let previous = lane.map(|l| l.tail.clone());

    let transport = Arc::clone(&self.transport);
    let cache = Arc::clone(&self.cache);
    let all_lanes = Arc::clone(&self.lanes);
    let task_key = key.clone();

    let run = async move {
      if let Some(previous) = previous {
        // Outcome of the earlier write does not matter, only its completion
        let _ = previous.await;
      }
      let result = execute(transport, cache, mutation).await;
      release(&all_lanes, &task_key, seq);
      result
    }
    .boxed()
    .shared();

    // A later write on the entity ends coalescing with any earlier delete
    lanes.insert(
      key,
      Lane {
        tail_seq: seq,
        tail: run.clone(),
        pending_delete: is_delete.then(|| run.clone()),
      },
    );
    drop(lanes);

    tokio::spawn(run.clone());
    run
  }
}

/// Drop lane bookkeeping that refers to the finished mutation `seq`.
fn release(lanes: &Mutex<HashMap<EntityKey, Lane>>, key: &EntityKey, seq: u64) {
  let mut lanes = lanes.lock().unwrap_or_else(|e| e.into_inner());
  let Some(lane) = lanes.get(key) else {
    return;
  };
  if lane.tail_seq == seq {
    lanes.remove(key);
  }
}

async fn execute(
  transport: Arc<Transport>,
  cache: Arc<CacheDirectory>,
  mutation: Mutation,
) -> Result<Response, ApiError> {
  let Mutation {
    resource,
    operation,
    target,
    request,
    invalidates,
  } = mutation;

  let response = transport.send(request).await?;

  for kind in &invalidates {
    cache.invalidate(*kind);
  }
  info!(
    %resource,
    ?operation,
    id = target.as_deref().unwrap_or("-"),
    invalidated = ?invalidates,
    "mutation applied"
  );

  Ok(response)
}
