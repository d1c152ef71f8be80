//! Per-file subscriptions for attribute, location, and permission updates.
//!
//! Each kind keeps a `file_uuid → registration` map. Attribute
//! subscriptions are time-bounded on the provider side and auto-renewed
//! while registered; location and permission subscriptions are
//! reference-counted until the last release. Cancellations are best-effort:
//! the local registration is dropped even when the cancel message cannot be
//! sent, so no server slot is leaked past the session.

use crate::comm::Communicator;
use crate::error::ClientError;
use crate::scheduler::{CancelHandle, Scheduler};
use remora_proto::{ClientBody, ServerBody, SubscribeRequest};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Provider-side lifetime of a file-attribute subscription; renewal
/// re-subscribes at this cadence.
pub const FILE_ATTR_SUBSCRIPTION_DURATION: Duration = Duration::from_secs(30);

struct AttrRegistration {
    id: i64,
    renew: CancelHandle,
}

struct CountedRegistration {
    id: i64,
    refs: u32,
}

pub struct FsSubscriptions {
    weak: Weak<FsSubscriptions>,
    communicator: Arc<Communicator>,
    scheduler: Scheduler,
    runtime: tokio::runtime::Handle,
    attr: Mutex<HashMap<String, AttrRegistration>>,
    location: Mutex<HashMap<String, CountedRegistration>>,
    permission: Mutex<HashMap<String, CountedRegistration>>,
}

impl FsSubscriptions {
    pub fn new(communicator: Arc<Communicator>, scheduler: Scheduler) -> Arc<Self> {
        Arc::new_cyclic(|weak| FsSubscriptions {
            weak: weak.clone(),
            communicator,
            scheduler,
            runtime: tokio::runtime::Handle::current(),
            attr: Mutex::new(HashMap::new()),
            location: Mutex::new(HashMap::new()),
            permission: Mutex::new(HashMap::new()),
        })
    }

    // -----------------------------------------------------------------------
    // File attributes (time-bounded, auto-renewed)
    // -----------------------------------------------------------------------

    pub async fn add_file_attr_subscription(&self, file_uuid: &str) -> Result<(), ClientError> {
        let mut attr = self.attr.lock().await;
        if attr.contains_key(file_uuid) {
            return Ok(());
        }
        let id = self.subscribe(attr_request(file_uuid)).await?;
        let renew = self.schedule_attr_renewal(file_uuid.to_owned());
        attr.insert(file_uuid.to_owned(), AttrRegistration { id, renew });
        Ok(())
    }

    pub async fn remove_file_attr_subscription(&self, file_uuid: &str) {
        let registration = self.attr.lock().await.remove(file_uuid);
        if let Some(registration) = registration {
            registration.renew.cancel();
            self.cancel(registration.id);
        }
    }

    fn schedule_attr_renewal(&self, file_uuid: String) -> CancelHandle {
        let weak = self.weak.clone();
        let runtime = self.runtime.clone();
        self.scheduler
            .schedule(FILE_ATTR_SUBSCRIPTION_DURATION, move || {
                let Some(subscriptions) = weak.upgrade() else {
                    return;
                };
                runtime.spawn(async move {
                    subscriptions.renew_attr(file_uuid).await;
                });
            })
    }

    async fn renew_attr(self: Arc<Self>, file_uuid: String) {
        let mut attr = self.attr.lock().await;
        if !attr.contains_key(&file_uuid) {
            return;
        }
        match self.subscribe(attr_request(&file_uuid)).await {
            Ok(id) => {
                debug!(file_uuid = %file_uuid, id, "attribute subscription renewed");
                let renew = self.schedule_attr_renewal(file_uuid.clone());
                attr.insert(file_uuid, AttrRegistration { id, renew });
            }
            Err(e) => {
                warn!(file_uuid = %file_uuid, error = %e, "attribute renewal failed, retrying");
                let renew = self.schedule_attr_renewal(file_uuid.clone());
                if let Some(registration) = attr.get_mut(&file_uuid) {
                    registration.renew = renew;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // File location (reference-counted)
    // -----------------------------------------------------------------------

    pub async fn add_file_location_subscription(
        &self,
        file_uuid: &str,
    ) -> Result<(), ClientError> {
        let mut location = self.location.lock().await;
        if let Some(registration) = location.get_mut(file_uuid) {
            registration.refs += 1;
            return Ok(());
        }
        let id = self
            .subscribe(SubscribeRequest::FileLocation {
                file_uuid: file_uuid.to_owned(),
            })
            .await?;
        location.insert(file_uuid.to_owned(), CountedRegistration { id, refs: 1 });
        Ok(())
    }

    pub async fn remove_file_location_subscription(&self, file_uuid: &str) {
        let mut location = self.location.lock().await;
        self.release_counted(&mut location, file_uuid);
    }

    // -----------------------------------------------------------------------
    // Permission changes (reference-counted)
    // -----------------------------------------------------------------------

    pub async fn add_permission_changed_subscription(
        &self,
        file_uuid: &str,
    ) -> Result<(), ClientError> {
        let mut permission = self.permission.lock().await;
        if let Some(registration) = permission.get_mut(file_uuid) {
            registration.refs += 1;
            return Ok(());
        }
        let id = self
            .subscribe(SubscribeRequest::PermissionChanged {
                file_uuid: file_uuid.to_owned(),
            })
            .await?;
        permission.insert(file_uuid.to_owned(), CountedRegistration { id, refs: 1 });
        Ok(())
    }

    pub async fn remove_permission_changed_subscription(&self, file_uuid: &str) {
        let mut permission = self.permission.lock().await;
        self.release_counted(&mut permission, file_uuid);
    }

    // -----------------------------------------------------------------------
    // Wire helpers
    // -----------------------------------------------------------------------

    fn release_counted(
        &self,
        map: &mut HashMap<String, CountedRegistration>,
        file_uuid: &str,
    ) {
        let Some(registration) = map.get_mut(file_uuid) else {
            return;
        };
        registration.refs -= 1;
        if registration.refs == 0 {
            let id = registration.id;
            map.remove(file_uuid);
            self.cancel(id);
        }
    }

    async fn subscribe(&self, request: SubscribeRequest) -> Result<i64, ClientError> {
        let reply = self
            .communicator
            .communicate(ClientBody::Subscribe(request))
            .await?;
        match reply.body {
            ServerBody::SubscribeReply { id } => Ok(id),
            ServerBody::Status { code } => Err(ClientError::Remote(code)),
            _ => Err(ClientError::UnexpectedReply),
        }
    }

    /// Best-effort cancellation; a lost cancel expires server-side with the
    /// session.
    fn cancel(&self, id: i64) {
        self.communicator.send(ClientBody::SubscribeCancel { id });
    }
}

fn attr_request(file_uuid: &str) -> SubscribeRequest {
    SubscribeRequest::FileAttr {
        file_uuid: file_uuid.to_owned(),
        time_threshold_ms: Some(FILE_ATTR_SUBSCRIPTION_DURATION.as_millis() as u64),
    }
}
