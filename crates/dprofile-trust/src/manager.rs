//! Trust and access-control ledger
//!
//! ## Consistency rules
//!
//! - Accesser and accessee rows are shared between ACLs. They are reused
//!   when an identical identity already exists and removed only when the
//!   last ACL referencing them is deleted.
//! - The `trust_device_table` row of a peer exists exactly while at least
//!   one ACL names the peer as its trusted device. Its status is ACTIVE iff
//!   any non-LNN ACL for the peer is ACTIVE.
//! - Add/Delete notifications fire when the first/last relationship between
//!   a peer+user and a local+user appears/disappears. Active/Inactive fire
//!   when the first active relationship appears or the last one goes away.
//!   LNN rows never notify.
//!
//! Every public operation holds one async mutex from its first read to its
//! last write, so the refcount and aggregate checks see a stable ledger.
//! A successful mutation then refreshes the store backup, which is what the
//! store restores from when it finds the database corrupt.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::Mutex;

use dprofile_core::domain::matching::{aggregate_status, matches_query, remove_lnn_acl};
use dprofile_core::domain::{
    anonymize, AccessControlProfile, BindLevel, BindType, ProfileError, QueryProfile, QueryType,
    Status, StorageOp, TrustDeviceProfile,
};
use dprofile_core::ports::{IDeviceManager, IRelationalStore, ISubscriptionRegistry, Row, Value};

use crate::mapping::*;

/// Parameter keys understood by [`TrustProfileManager::get_access_control_profile_by_params`]
pub mod params {
    pub const TRUST_DEVICE_ID: &str = "trustDeviceId";
    pub const STATUS: &str = "status";
    pub const USER_ID: &str = "userId";
    pub const BUNDLE_NAME: &str = "bundleName";
    pub const TOKEN_ID: &str = "tokenId";
    pub const BIND_TYPE: &str = "bindType";
    pub const ACCOUNT_ID: &str = "accountId";
    pub const ACCESSER_DEVICE_ID: &str = "accesserDeviceId";
    pub const ACCESSER_USER_ID: &str = "accesserUserId";
    pub const ACCESSER_ACCOUNT_ID: &str = "accesserAccountId";
    pub const ACCESSER_TOKEN_ID: &str = "accesserTokenId";
    pub const ACCESSEE_DEVICE_ID: &str = "accesseeDeviceId";
    pub const ACCESSEE_USER_ID: &str = "accesseeUserId";
    pub const ACCESSEE_ACCOUNT_ID: &str = "accesseeAccountId";
    pub const ACCESSEE_TOKEN_ID: &str = "accesseeTokenId";
}

/// One supported ACL query shape
#[derive(Debug, Clone, PartialEq, Eq)]
enum AclLookup {
    UserBundleTrustDevice {
        user_id: i32,
        bundle_name: String,
        trust_device_id: String,
        status: Status,
    },
    BundleTrustDevice {
        bundle_name: String,
        trust_device_id: String,
        status: Status,
    },
    TokenTrustDevice {
        token_id: i64,
        trust_device_id: String,
        status: Status,
    },
    UserBundleBindType {
        user_id: i32,
        bundle_name: String,
        bind_type: BindType,
        status: Status,
    },
    BundleBindType {
        bundle_name: String,
        bind_type: BindType,
        status: Status,
    },
    UserAccount {
        user_id: i32,
        account_id: String,
    },
    User {
        user_id: i32,
    },
    Query {
        query_type: QueryType,
        query: QueryProfile,
    },
}

impl AclLookup {
    fn strings(&self) -> Vec<(&'static str, &str)> {
        match self {
            AclLookup::UserBundleTrustDevice {
                bundle_name,
                trust_device_id,
                ..
            }
            | AclLookup::BundleTrustDevice {
                bundle_name,
                trust_device_id,
                ..
            } => vec![
                ("bundleName", bundle_name.as_str()),
                ("trustDeviceId", trust_device_id.as_str()),
            ],
            AclLookup::TokenTrustDevice {
                trust_device_id, ..
            } => vec![("trustDeviceId", trust_device_id.as_str())],
            AclLookup::UserBundleBindType { bundle_name, .. }
            | AclLookup::BundleBindType { bundle_name, .. } => {
                vec![("bundleName", bundle_name.as_str())]
            }
            AclLookup::UserAccount { account_id, .. } => vec![("accountId", account_id.as_str())],
            AclLookup::User { .. } => Vec::new(),
            AclLookup::Query { query, .. } => vec![
                ("accesserDeviceId", query.accesser_device_id.as_str()),
                ("accesserAccountId", query.accesser_account_id.as_str()),
                ("accesseeDeviceId", query.accessee_device_id.as_str()),
                ("accesseeAccountId", query.accessee_account_id.as_str()),
            ],
        }
    }
}

/// Identity row written by an ACL put that is not yet referenced
#[derive(Debug, Clone, Copy)]
enum IdentityRow {
    Accesser(i64),
    Accessee(i64),
}

/// The trust ledger
pub struct TrustProfileManager {
    store: Arc<dyn IRelationalStore>,
    registry: Arc<dyn ISubscriptionRegistry>,
    device_manager: Arc<dyn IDeviceManager>,
    max_string_len: usize,
    lock: Mutex<()>,
}

impl TrustProfileManager {
    /// Creates a ledger over an already constructed relational store
    ///
    /// # Arguments
    ///
    /// * `store` - Relational port holding the four trust tables
    /// * `registry` - Receives trust device notifications
    /// * `device_manager` - Told about every newly stored ACL
    /// * `max_string_len` - Upper bound for string query parameters
    pub fn new(
        store: Arc<dyn IRelationalStore>,
        registry: Arc<dyn ISubscriptionRegistry>,
        device_manager: Arc<dyn IDeviceManager>,
        max_string_len: usize,
    ) -> Self {
        Self {
            store,
            registry,
            device_manager,
            max_string_len,
            lock: Mutex::new(()),
        }
    }

    pub async fn init(&self) -> Result<(), ProfileError> {
        self.store
            .init()
            .await
            .map_err(|e| ProfileError::storage(StorageOp::Init, e))?;
        self.refresh_backup().await;
        tracing::info!("Trust profile manager initialized");
        Ok(())
    }

    pub async fn uninit(&self) -> Result<(), ProfileError> {
        let _guard = self.lock.lock().await;
        self.store
            .uninit()
            .await
            .map_err(|e| ProfileError::storage(StorageOp::Init, e))
    }

    // ------------------------------------------------------------------
    // Trust devices
    // ------------------------------------------------------------------

    /// Stores a trust device row; the device must not exist yet
    pub async fn put_trust_device_profile(
        &self,
        profile: &TrustDeviceProfile,
    ) -> Result<(), ProfileError> {
        self.check_len("deviceId", &profile.device_id)?;
        let _guard = self.lock.lock().await;
        if self.find_trust_device(&profile.device_id).await?.is_some() {
            return Err(ProfileError::DataExists(format!(
                "trust device {}",
                anonymize(&profile.device_id)
            )));
        }
        self.insert_trust_device(profile).await?;
        self.refresh_backup().await;
        Ok(())
    }

    pub async fn get_trust_device_profile(
        &self,
        device_id: &str,
    ) -> Result<TrustDeviceProfile, ProfileError> {
        self.check_len("deviceId", device_id)?;
        let _guard = self.lock.lock().await;
        self.find_trust_device(device_id)
            .await?
            .ok_or_else(|| ProfileError::NotFound(format!("trust device {}", anonymize(device_id))))
    }

    pub async fn get_all_trust_device_profile(
        &self,
    ) -> Result<Vec<TrustDeviceProfile>, ProfileError> {
        let _guard = self.lock.lock().await;
        let rows = self.query(SELECT_ALL_TRUST_DEVICES, Vec::new()).await?;
        if rows.is_empty() {
            return Err(ProfileError::NotFound("trust device table is empty".into()));
        }
        Ok(rows.iter().map(trust_device_from_row).collect())
    }

    /// Replaces a trust device row, notifying Update when the status changes
    pub async fn update_trust_device_profile(
        &self,
        profile: &TrustDeviceProfile,
    ) -> Result<(), ProfileError> {
        self.check_len("deviceId", &profile.device_id)?;
        let _guard = self.lock.lock().await;
        let old = self.find_trust_device(&profile.device_id).await?.ok_or_else(|| {
            ProfileError::NotFound(format!("trust device {}", anonymize(&profile.device_id)))
        })?;
        self.write_trust_device_update(&old, profile).await?;
        self.refresh_backup().await;
        Ok(())
    }

    pub async fn delete_trust_device_profile(&self, device_id: &str) -> Result<(), ProfileError> {
        self.check_len("deviceId", device_id)?;
        let _guard = self.lock.lock().await;
        if self.find_trust_device(device_id).await?.is_none() {
            return Err(ProfileError::NotFound(format!(
                "trust device {}",
                anonymize(device_id)
            )));
        }
        self.remove_trust_device(device_id).await?;
        self.refresh_backup().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // ACL mutations
    // ------------------------------------------------------------------

    /// Stores an ACL, assigning ids and sharing identical identities
    ///
    /// Storing an ACL identical to an existing one (ignoring status and
    /// extra data) succeeds without writing it again.
    pub async fn put_access_control_profile(
        &self,
        profile: &AccessControlProfile,
    ) -> Result<(), ProfileError> {
        self.check_len("trustDeviceId", &profile.trust_device_id)?;
        let acl = {
            let _guard = self.lock.lock().await;

            let existing = self.load_acls(None, Vec::new()).await?;
            let pair = profile.peer_pair();
            let peer_existed = existing
                .iter()
                .filter(|p| !p.is_lnn_acl())
                .any(|p| p.links(&pair));

            let mut acl = profile.clone();
            let (new_accesser, new_accessee) = self.assign_ids(&mut acl).await?;
            if !self.insert_acl_rows(&acl, new_accesser, new_accessee).await? {
                tracing::info!(
                    trust_device_id = %anonymize(&acl.trust_device_id),
                    "Access control profile already exists"
                );
                return Ok(());
            }
            tracing::info!(
                access_control_id = acl.access_control_id,
                accesser_id = acl.accesser_id,
                accessee_id = acl.accessee_id,
                trust_device_id = %anonymize(&acl.trust_device_id),
                bind_type = acl.bind_type.as_u32(),
                status = acl.status.as_i32(),
                "Access control profile stored"
            );

            self.put_acl_check(&acl, peer_existed).await?;
            self.refresh_backup().await;
            acl
        };

        self.device_manager
            .on_acl_added(acl.access_control_id, &acl.trust_device_id, acl.bind_type)
            .await;
        Ok(())
    }

    /// Rewrites an ACL and both of its identities
    ///
    /// The accesser and accessee ids are immutable.
    pub async fn update_access_control_profile(
        &self,
        profile: &AccessControlProfile,
    ) -> Result<(), ProfileError> {
        self.check_len("trustDeviceId", &profile.trust_device_id)?;
        let _guard = self.lock.lock().await;

        let old = self
            .load_acl(profile.access_control_id)
            .await?
            .ok_or_else(|| {
                ProfileError::NotFound(format!(
                    "access control id {}",
                    profile.access_control_id
                ))
            })?;
        if old.accessee_id != profile.accessee.accessee_id
            || old.accesser_id != profile.accesser.accesser_id
            || old.accesser_id != profile.accesser_id
            || old.accessee_id != profile.accessee_id
        {
            tracing::error!(
                access_control_id = profile.access_control_id,
                "Refusing to change accesser or accessee id"
            );
            return Err(ProfileError::NotAllowed(
                "accesser and accessee ids cannot be updated".into(),
            ));
        }

        self.store
            .update(
                ACCESSER_TABLE,
                &accesser_to_values(&profile.accesser),
                WHERE_ACCESSER_ID,
                &[Value::from(profile.accesser_id)],
            )
            .await
            .map_err(|e| ProfileError::storage(StorageOp::UpdateAccesser, e))?;
        self.store
            .update(
                ACCESSEE_TABLE,
                &accessee_to_values(&profile.accessee),
                WHERE_ACCESSEE_ID,
                &[Value::from(profile.accessee_id)],
            )
            .await
            .map_err(|e| ProfileError::storage(StorageOp::UpdateAccessee, e))?;
        self.store
            .update(
                ACCESS_CONTROL_TABLE,
                &acl_to_values(profile),
                WHERE_ACCESS_CONTROL_ID,
                &[Value::from(profile.access_control_id)],
            )
            .await
            .map_err(|e| ProfileError::storage(StorageOp::UpdateAcl, e))?;
        tracing::info!(
            access_control_id = profile.access_control_id,
            old_status = old.status.as_i32(),
            new_status = profile.status.as_i32(),
            "Access control profile updated"
        );

        self.notify_status_transition(profile, &old).await?;
        self.refresh_trust_device(profile).await?;
        self.refresh_backup().await;
        Ok(())
    }

    /// Deletes an ACL, dropping identities and the trust device row once unreferenced
    pub async fn delete_access_control_profile(
        &self,
        access_control_id: i64,
    ) -> Result<(), ProfileError> {
        let _guard = self.lock.lock().await;

        let acl = self.load_acl(access_control_id).await?.ok_or_else(|| {
            ProfileError::NotFound(format!("access control id {}", access_control_id))
        })?;

        if self
            .count(COUNT_ACL_BY_ACCESSEE, vec![Value::from(acl.accessee_id)])
            .await?
            == 1
        {
            self.store
                .delete(ACCESSEE_TABLE, WHERE_ACCESSEE_ID, &[Value::from(acl.accessee_id)])
                .await
                .map_err(|e| ProfileError::storage(StorageOp::DeleteAccessee, e))?;
            tracing::debug!(accessee_id = acl.accessee_id, "Accessee deleted");
        }
        if self
            .count(COUNT_ACL_BY_ACCESSER, vec![Value::from(acl.accesser_id)])
            .await?
            == 1
        {
            self.store
                .delete(ACCESSER_TABLE, WHERE_ACCESSER_ID, &[Value::from(acl.accesser_id)])
                .await
                .map_err(|e| ProfileError::storage(StorageOp::DeleteAccesser, e))?;
            tracing::debug!(accesser_id = acl.accesser_id, "Accesser deleted");
        }
        self.store
            .delete(
                ACCESS_CONTROL_TABLE,
                WHERE_ACCESS_CONTROL_ID,
                &[Value::from(access_control_id)],
            )
            .await
            .map_err(|e| ProfileError::storage(StorageOp::DeleteAcl, e))?;
        tracing::info!(
            access_control_id,
            trust_device_id = %anonymize(&acl.trust_device_id),
            "Access control profile deleted"
        );

        self.delete_trust_device_check(&acl).await?;
        self.refresh_backup().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // ACL queries
    // ------------------------------------------------------------------

    /// ACLs for a trusted device and status, owned by `user_id` + `bundle_name` on either side
    pub async fn get_acl_by_user_bundle_and_trust_device(
        &self,
        user_id: i32,
        bundle_name: &str,
        trust_device_id: &str,
        status: Status,
    ) -> Result<Vec<AccessControlProfile>, ProfileError> {
        self.lookup(AclLookup::UserBundleTrustDevice {
            user_id,
            bundle_name: bundle_name.to_string(),
            trust_device_id: trust_device_id.to_string(),
            status,
        })
        .await
    }

    pub async fn get_acl_by_bundle_and_trust_device(
        &self,
        bundle_name: &str,
        trust_device_id: &str,
        status: Status,
    ) -> Result<Vec<AccessControlProfile>, ProfileError> {
        self.lookup(AclLookup::BundleTrustDevice {
            bundle_name: bundle_name.to_string(),
            trust_device_id: trust_device_id.to_string(),
            status,
        })
        .await
    }

    /// ACLs where `trust_device_id` is one side and `token_id` the other
    pub async fn get_acl_by_token_id(
        &self,
        token_id: i64,
        trust_device_id: &str,
        status: Status,
    ) -> Result<Vec<AccessControlProfile>, ProfileError> {
        self.lookup(AclLookup::TokenTrustDevice {
            token_id,
            trust_device_id: trust_device_id.to_string(),
            status,
        })
        .await
    }

    pub async fn get_acl_by_user_bundle_and_bind_type(
        &self,
        user_id: i32,
        bundle_name: &str,
        bind_type: BindType,
        status: Status,
    ) -> Result<Vec<AccessControlProfile>, ProfileError> {
        self.lookup(AclLookup::UserBundleBindType {
            user_id,
            bundle_name: bundle_name.to_string(),
            bind_type,
            status,
        })
        .await
    }

    pub async fn get_acl_by_bundle_and_bind_type(
        &self,
        bundle_name: &str,
        bind_type: BindType,
        status: Status,
    ) -> Result<Vec<AccessControlProfile>, ProfileError> {
        self.lookup(AclLookup::BundleBindType {
            bundle_name: bundle_name.to_string(),
            bind_type,
            status,
        })
        .await
    }

    pub async fn get_acl_by_user_and_account(
        &self,
        user_id: i32,
        account_id: &str,
    ) -> Result<Vec<AccessControlProfile>, ProfileError> {
        self.lookup(AclLookup::UserAccount {
            user_id,
            account_id: account_id.to_string(),
        })
        .await
    }

    pub async fn get_acl_by_user(
        &self,
        user_id: i32,
    ) -> Result<Vec<AccessControlProfile>, ProfileError> {
        self.lookup(AclLookup::User { user_id }).await
    }

    /// Active ACLs matching `query` in either direction
    pub async fn get_acl_by_query(
        &self,
        query_type: QueryType,
        query: &QueryProfile,
    ) -> Result<Vec<AccessControlProfile>, ProfileError> {
        self.lookup(AclLookup::Query {
            query_type,
            query: query.clone(),
        })
        .await
    }

    /// Dispatches a string parameter map to the first query shape it satisfies
    ///
    /// Shapes are tried in this order: trusted device + status (with user
    /// and bundle, bundle, or token), bind type + status (with user and
    /// bundle, or bundle), user (with or without account), and finally a
    /// bidirectional accesser/accessee query.
    pub async fn get_access_control_profile_by_params(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<Vec<AccessControlProfile>, ProfileError> {
        let lookup = lookup_from_params(params).ok_or_else(|| {
            tracing::error!(keys = ?params.keys().collect::<Vec<_>>(), "Unsupported ACL query parameters");
            ProfileError::InvalidParams("no supported parameter combination".into())
        })?;
        self.lookup(lookup).await
    }

    /// Every ACL except LNN rows
    pub async fn get_all_access_control_profile(
        &self,
    ) -> Result<Vec<AccessControlProfile>, ProfileError> {
        let _guard = self.lock.lock().await;
        let mut profiles = self.load_acls(None, Vec::new()).await?;
        remove_lnn_acl(&mut profiles);
        non_empty(profiles, "access control table has no ACL")
    }

    /// Every ACL including LNN rows
    pub async fn get_all_acl_include_lnn_acl(
        &self,
    ) -> Result<Vec<AccessControlProfile>, ProfileError> {
        let _guard = self.lock.lock().await;
        let profiles = self.load_acls(None, Vec::new()).await?;
        non_empty(profiles, "access control table is empty")
    }

    // ------------------------------------------------------------------
    // Internals; callers hold the lock
    // ------------------------------------------------------------------

    fn check_len(&self, field: &str, value: &str) -> Result<(), ProfileError> {
        if value.len() > self.max_string_len {
            tracing::error!(field, len = value.len(), "Parameter too long");
            return Err(ProfileError::InvalidParams(format!(
                "{} exceeds {} bytes",
                field, self.max_string_len
            )));
        }
        Ok(())
    }

    async fn lookup(&self, lookup: AclLookup) -> Result<Vec<AccessControlProfile>, ProfileError> {
        for (field, value) in lookup.strings() {
            self.check_len(field, value)?;
        }
        let _guard = self.lock.lock().await;
        let mut profiles = self.run_lookup(&lookup).await?;
        remove_lnn_acl(&mut profiles);
        non_empty(profiles, "no matching access control profile")
    }

    async fn run_lookup(
        &self,
        lookup: &AclLookup,
    ) -> Result<Vec<AccessControlProfile>, ProfileError> {
        const BY_TRUST_DEVICE_AND_STATUS: &str = "a.trustDeviceId = ? AND a.status = ?";
        const BY_BIND_TYPE_AND_STATUS: &str = "a.bindType = ? AND a.status = ?";

        let profiles = match lookup {
            AclLookup::UserBundleTrustDevice {
                user_id,
                bundle_name,
                trust_device_id,
                status,
            } => self
                .load_acls(
                    Some(BY_TRUST_DEVICE_AND_STATUS),
                    vec![Value::from(trust_device_id), Value::from(status.as_i32())],
                )
                .await?
                .into_iter()
                .filter(|acl| owned_by_user_and_bundle(acl, *user_id, bundle_name))
                .collect(),
            AclLookup::BundleTrustDevice {
                bundle_name,
                trust_device_id,
                status,
            } => self
                .load_acls(
                    Some(BY_TRUST_DEVICE_AND_STATUS),
                    vec![Value::from(trust_device_id), Value::from(status.as_i32())],
                )
                .await?
                .into_iter()
                .filter(|acl| owned_by_bundle(acl, bundle_name))
                .collect(),
            AclLookup::TokenTrustDevice {
                token_id,
                trust_device_id,
                status,
            } => self
                .load_acls(Some("a.status = ?"), vec![Value::from(status.as_i32())])
                .await?
                .into_iter()
                .filter(|acl| links_token_to_device(acl, *token_id, trust_device_id))
                .collect(),
            AclLookup::UserBundleBindType {
                user_id,
                bundle_name,
                bind_type,
                status,
            } => self
                .load_acls(
                    Some(BY_BIND_TYPE_AND_STATUS),
                    vec![Value::from(bind_type.as_u32()), Value::from(status.as_i32())],
                )
                .await?
                .into_iter()
                .filter(|acl| owned_by_user_and_bundle(acl, *user_id, bundle_name))
                .collect(),
            AclLookup::BundleBindType {
                bundle_name,
                bind_type,
                status,
            } => self
                .load_acls(
                    Some(BY_BIND_TYPE_AND_STATUS),
                    vec![Value::from(bind_type.as_u32()), Value::from(status.as_i32())],
                )
                .await?
                .into_iter()
                .filter(|acl| owned_by_bundle(acl, bundle_name))
                .collect(),
            AclLookup::UserAccount {
                user_id,
                account_id,
            } => self
                .load_acls(None, Vec::new())
                .await?
                .into_iter()
                .filter(|acl| {
                    (acl.accesser.user_id == *user_id && acl.accesser.account_id == *account_id)
                        || (acl.accessee.user_id == *user_id
                            && acl.accessee.account_id == *account_id)
                })
                .collect(),
            AclLookup::User { user_id } => self
                .load_acls(None, Vec::new())
                .await?
                .into_iter()
                .filter(|acl| acl.accesser.user_id == *user_id || acl.accessee.user_id == *user_id)
                .collect(),
            AclLookup::Query { query_type, query } => self
                .load_acls(None, Vec::new())
                .await?
                .into_iter()
                .filter(|acl| matches_query(*query_type, query, acl))
                .collect(),
        };
        Ok(profiles)
    }

    async fn query(&self, sql: &str, args: Vec<Value>) -> Result<Vec<Row>, ProfileError> {
        self.store
            .query(sql, &args)
            .await
            .map_err(|e| ProfileError::storage(StorageOp::Query, e))
    }

    async fn count(&self, sql: &str, args: Vec<Value>) -> Result<i64, ProfileError> {
        let rows = self.query(sql, args).await?;
        Ok(rows.first().map(|r| r.get_i64("n")).unwrap_or(0))
    }

    async fn next_id(&self, sql: &str) -> Result<i64, ProfileError> {
        let rows = self.query(sql, Vec::new()).await?;
        Ok(rows.first().map(|r| r.get_i64("maxId")).unwrap_or(0) + 1)
    }

    /// Loads ACLs joined with their identities, optionally filtered on `a.*` columns
    async fn load_acls(
        &self,
        filter: Option<&str>,
        args: Vec<Value>,
    ) -> Result<Vec<AccessControlProfile>, ProfileError> {
        let sql = match filter {
            Some(filter) => format!("{} WHERE {}{}", SELECT_ACL_JOINED, filter, ACL_ORDER),
            None => format!("{}{}", SELECT_ACL_JOINED, ACL_ORDER),
        };
        let rows = self.query(&sql, args).await?;
        Ok(rows.iter().map(acl_from_joined_row).collect())
    }

    async fn load_acl(
        &self,
        access_control_id: i64,
    ) -> Result<Option<AccessControlProfile>, ProfileError> {
        Ok(self
            .load_acls(
                Some("a.accessControlId = ?"),
                vec![Value::from(access_control_id)],
            )
            .await?
            .into_iter()
            .next())
    }

    /// Fills in the ACL, accesser and accessee ids
    ///
    /// Returns whether the accesser and accessee rows still have to be written.
    async fn assign_ids(&self, acl: &mut AccessControlProfile) -> Result<(bool, bool), ProfileError> {
        acl.access_control_id = self.next_id(SELECT_MAX_ACL_ID).await?;

        let accesser_args = accesser_attributes(&acl.accesser)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        let (accesser_id, new_accesser) = match self
            .query(SELECT_ACCESSER_BY_ALL, accesser_args)
            .await?
            .first()
        {
            Some(row) => (row.get_i64("accesserId"), false),
            None => (self.next_id(SELECT_MAX_ACCESSER_ID).await?, true),
        };

        let accessee_args = accessee_attributes(&acl.accessee)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        let (accessee_id, new_accessee) = match self
            .query(SELECT_ACCESSEE_BY_ALL, accessee_args)
            .await?
            .first()
        {
            Some(row) => (row.get_i64("accesseeId"), false),
            None => (self.next_id(SELECT_MAX_ACCESSEE_ID).await?, true),
        };

        acl.accesser_id = accesser_id;
        acl.accesser.accesser_id = accesser_id;
        acl.accessee_id = accessee_id;
        acl.accessee.accessee_id = accessee_id;
        Ok((new_accesser, new_accessee))
    }

    /// Writes the new identity rows and the ACL row
    ///
    /// Returns `false` when an identical ACL is already stored. Identity rows
    /// written here are deleted again unless the ACL row lands, so a failed
    /// put never leaves an accesser or accessee that no ACL references.
    async fn insert_acl_rows(
        &self,
        acl: &AccessControlProfile,
        new_accesser: bool,
        new_accessee: bool,
    ) -> Result<bool, ProfileError> {
        let mut written = Vec::new();
        let result = self
            .try_insert_acl_rows(acl, new_accesser, new_accessee, &mut written)
            .await;
        if !matches!(result, Ok(true)) {
            self.roll_back_identities(&written).await;
        }
        result
    }

    async fn try_insert_acl_rows(
        &self,
        acl: &AccessControlProfile,
        new_accesser: bool,
        new_accessee: bool,
        written: &mut Vec<IdentityRow>,
    ) -> Result<bool, ProfileError> {
        if new_accesser {
            self.store
                .put(ACCESSER_TABLE, &accesser_to_values(&acl.accesser))
                .await
                .map_err(|e| ProfileError::storage(StorageOp::PutAccesser, e))?;
            written.push(IdentityRow::Accesser(acl.accesser_id));
            tracing::debug!(accesser_id = acl.accesser_id, "Accesser stored");
        }
        if new_accessee {
            self.store
                .put(ACCESSEE_TABLE, &accessee_to_values(&acl.accessee))
                .await
                .map_err(|e| ProfileError::storage(StorageOp::PutAccessee, e))?;
            written.push(IdentityRow::Accessee(acl.accessee_id));
            tracing::debug!(accessee_id = acl.accessee_id, "Accessee stored");
        }

        if self.acl_exists(acl).await? {
            return Ok(false);
        }

        self.store
            .put(ACCESS_CONTROL_TABLE, &acl_to_values(acl))
            .await
            .map_err(|e| ProfileError::storage(StorageOp::PutAcl, e))?;
        Ok(true)
    }

    async fn roll_back_identities(&self, written: &[IdentityRow]) {
        for row in written.iter().rev() {
            let (table, where_clause, id) = match row {
                IdentityRow::Accesser(id) => (ACCESSER_TABLE, WHERE_ACCESSER_ID, *id),
                IdentityRow::Accessee(id) => (ACCESSEE_TABLE, WHERE_ACCESSEE_ID, *id),
            };
            match self.store.delete(table, where_clause, &[Value::from(id)]).await {
                Ok(_) => tracing::debug!(table, id, "Identity row rolled back"),
                Err(e) => tracing::error!(table, id, error = %e, "Failed to roll back identity row"),
            }
        }
    }

    /// Refreshes the backup used to recover from a corrupt database
    ///
    /// A failed backup is logged; the mutation before it stands.
    async fn refresh_backup(&self) {
        if let Err(e) = self.store.backup().await {
            tracing::warn!(error = %e, "Failed to back up trust ledger");
        }
    }

    async fn acl_exists(&self, acl: &AccessControlProfile) -> Result<bool, ProfileError> {
        Ok(!self
            .query(SELECT_ACL_BY_ALL_EXCEPT_STATUS, acl_identity_args(acl))
            .await?
            .is_empty())
    }

    async fn find_trust_device(
        &self,
        device_id: &str,
    ) -> Result<Option<TrustDeviceProfile>, ProfileError> {
        let rows = self
            .query(SELECT_TRUST_DEVICE, vec![Value::from(device_id)])
            .await?;
        Ok(rows.first().map(trust_device_from_row))
    }

    async fn insert_trust_device(&self, profile: &TrustDeviceProfile) -> Result<(), ProfileError> {
        self.store
            .put(TRUST_DEVICE_TABLE, &trust_device_to_values(profile))
            .await
            .map_err(|e| ProfileError::storage(StorageOp::PutTrustDevice, e))?;
        tracing::info!(
            device_id = %anonymize(&profile.device_id),
            status = profile.status.as_i32(),
            "Trust device profile stored"
        );
        Ok(())
    }

    async fn remove_trust_device(&self, device_id: &str) -> Result<(), ProfileError> {
        self.store
            .delete(TRUST_DEVICE_TABLE, WHERE_DEVICE_ID, &[Value::from(device_id)])
            .await
            .map_err(|e| ProfileError::storage(StorageOp::DeleteTrustDevice, e))?;
        tracing::info!(device_id = %anonymize(device_id), "Trust device profile deleted");
        Ok(())
    }

    async fn write_trust_device_update(
        &self,
        old: &TrustDeviceProfile,
        new: &TrustDeviceProfile,
    ) -> Result<(), ProfileError> {
        self.store
            .update(
                TRUST_DEVICE_TABLE,
                &trust_device_to_values(new),
                WHERE_DEVICE_ID,
                &[Value::from(&new.device_id)],
            )
            .await
            .map_err(|e| ProfileError::storage(StorageOp::UpdateTrustDevice, e))?;
        if old.status != new.status {
            tracing::info!(
                device_id = %anonymize(&new.device_id),
                old_status = old.status.as_i32(),
                new_status = new.status.as_i32(),
                "Trust device status changed"
            );
            self.registry
                .notify_trust_device_profile_update(old, new)
                .await
                .map_err(notify_failed)?;
        }
        Ok(())
    }

    /// Recomputes and persists the aggregate status of the ACL's trusted device
    ///
    /// The OS type and authentication form of an existing row are kept.
    async fn refresh_trust_device(&self, acl: &AccessControlProfile) -> Result<(), ProfileError> {
        let acls = self
            .load_acls(
                Some("a.trustDeviceId = ?"),
                vec![Value::from(&acl.trust_device_id)],
            )
            .await?;
        let mut trust = acl.to_trust_device_profile();
        trust.status = aggregate_status(&acls);
        match self.find_trust_device(&acl.trust_device_id).await? {
            Some(old) => {
                trust.os_type = old.os_type;
                trust.auth_form = old.auth_form;
                self.write_trust_device_update(&old, &trust).await
            }
            None => self.insert_trust_device(&trust).await,
        }
    }

    async fn put_acl_check(
        &self,
        acl: &AccessControlProfile,
        peer_existed: bool,
    ) -> Result<(), ProfileError> {
        let trust = acl.to_trust_device_profile();
        if !peer_existed && !acl.is_lnn_acl() {
            self.registry
                .notify_trust_device_profile_add(&trust)
                .await
                .map_err(notify_failed)?;
        }
        if self.find_trust_device(&acl.trust_device_id).await?.is_none() {
            return self.insert_trust_device(&trust).await;
        }
        self.refresh_trust_device(acl).await
    }

    async fn notify_status_transition(
        &self,
        profile: &AccessControlProfile,
        old: &AccessControlProfile,
    ) -> Result<(), ProfileError> {
        if profile.is_lnn_acl() {
            return Ok(());
        }
        let pair = profile.peer_pair();
        let active = self
            .load_acls(
                Some("a.trustDeviceId = ?"),
                vec![Value::from(&profile.trust_device_id)],
            )
            .await?
            .iter()
            .filter(|p| !p.is_lnn_acl() && p.status == Status::Active && p.links(&pair))
            .count();
        tracing::debug!(active, "Active relationships for peer and user");

        let trust = profile.to_trust_device_profile();
        if active == 1 && profile.status == Status::Active && old.status == Status::Inactive {
            self.registry
                .notify_trust_device_profile_active(&trust)
                .await
                .map_err(notify_failed)?;
        }
        if active == 0 && profile.status == Status::Inactive && old.status == Status::Active {
            self.registry
                .notify_trust_device_profile_inactive(&trust)
                .await
                .map_err(notify_failed)?;
        }
        Ok(())
    }

    async fn delete_trust_device_check(&self, acl: &AccessControlProfile) -> Result<(), ProfileError> {
        let remaining = self
            .load_acls(
                Some("a.trustDeviceId = ?"),
                vec![Value::from(&acl.trust_device_id)],
            )
            .await?;
        let pair = acl.peer_pair();
        let still_linked = remaining
            .iter()
            .filter(|p| !p.is_lnn_acl())
            .any(|p| p.links(&pair));
        if !still_linked && !acl.is_lnn_acl() {
            self.registry
                .notify_trust_device_profile_delete(&acl.to_trust_device_profile())
                .await
                .map_err(notify_failed)?;
        }

        let left = self
            .count(
                COUNT_ACL_BY_TRUST_DEVICE,
                vec![Value::from(&acl.trust_device_id)],
            )
            .await?;
        if left == 0 {
            if self.find_trust_device(&acl.trust_device_id).await?.is_some() {
                self.remove_trust_device(&acl.trust_device_id).await?;
            }
            return Ok(());
        }
        self.refresh_trust_device(acl).await
    }
}

fn notify_failed(err: anyhow::Error) -> ProfileError {
    tracing::error!(error = %err, "Trust notification failed");
    ProfileError::NotifyFailed(err.to_string())
}

fn non_empty(
    profiles: Vec<AccessControlProfile>,
    context: &str,
) -> Result<Vec<AccessControlProfile>, ProfileError> {
    if profiles.is_empty() {
        return Err(ProfileError::NotFound(context.to_string()));
    }
    Ok(profiles)
}

/// SAME_ACCOUNT or USER-level grants apply to every bundle and token of the user
fn is_account_wide(acl: &AccessControlProfile) -> bool {
    acl.bind_type == BindType::SameAccount || acl.bind_level == BindLevel::User
}

fn owned_by_user_and_bundle(acl: &AccessControlProfile, user_id: i32, bundle_name: &str) -> bool {
    if is_account_wide(acl) {
        return acl.accesser.user_id == user_id || acl.accessee.user_id == user_id;
    }
    (acl.accesser.user_id == user_id && acl.accesser.bundle_name == bundle_name)
        || (acl.accessee.user_id == user_id && acl.accessee.bundle_name == bundle_name)
}

fn owned_by_bundle(acl: &AccessControlProfile, bundle_name: &str) -> bool {
    is_account_wide(acl)
        || acl.accesser.bundle_name == bundle_name
        || acl.accessee.bundle_name == bundle_name
}

fn links_token_to_device(acl: &AccessControlProfile, token_id: i64, trust_device_id: &str) -> bool {
    if is_account_wide(acl) {
        return acl.accesser.device_id == trust_device_id
            || acl.accessee.device_id == trust_device_id;
    }
    (acl.accesser.device_id == trust_device_id && acl.accessee.token_id == token_id)
        || (acl.accessee.device_id == trust_device_id && acl.accesser.token_id == token_id)
}

fn param<T: FromStr>(params: &HashMap<String, String>, key: &str) -> Option<T> {
    params.get(key)?.trim().parse().ok()
}

fn lookup_from_params(map: &HashMap<String, String>) -> Option<AclLookup> {
    use self::params::*;

    let bundle = map.get(BUNDLE_NAME).cloned();
    let user = param::<i32>(map, USER_ID);

    if let (Some(trust_device_id), Some(status)) =
        (map.get(TRUST_DEVICE_ID), param::<i32>(map, STATUS))
    {
        let status = Status::from(status);
        if let (Some(user_id), Some(bundle_name)) = (user, bundle.clone()) {
            return Some(AclLookup::UserBundleTrustDevice {
                user_id,
                bundle_name,
                trust_device_id: trust_device_id.clone(),
                status,
            });
        }
        if let Some(bundle_name) = bundle.clone() {
            return Some(AclLookup::BundleTrustDevice {
                bundle_name,
                trust_device_id: trust_device_id.clone(),
                status,
            });
        }
        if let Some(token_id) = param::<i64>(map, TOKEN_ID) {
            return Some(AclLookup::TokenTrustDevice {
                token_id,
                trust_device_id: trust_device_id.clone(),
                status,
            });
        }
    }

    if let (Some(bind_type), Some(status)) =
        (param::<u32>(map, BIND_TYPE), param::<i32>(map, STATUS))
    {
        let (bind_type, status) = (BindType::from(bind_type), Status::from(status));
        if let (Some(user_id), Some(bundle_name)) = (user, bundle.clone()) {
            return Some(AclLookup::UserBundleBindType {
                user_id,
                bundle_name,
                bind_type,
                status,
            });
        }
        if let Some(bundle_name) = bundle {
            return Some(AclLookup::BundleBindType {
                bundle_name,
                bind_type,
                status,
            });
        }
    }

    if let Some(user_id) = user {
        return Some(match map.get(ACCOUNT_ID) {
            Some(account_id) => AclLookup::UserAccount {
                user_id,
                account_id: account_id.clone(),
            },
            None => AclLookup::User { user_id },
        });
    }

    query_from_params(map).map(|(query_type, query)| AclLookup::Query { query_type, query })
}

/// Builds a bidirectional query; the accessee side is optional
fn query_from_params(map: &HashMap<String, String>) -> Option<(QueryType, QueryProfile)> {
    use self::params::*;

    let mut query = QueryProfile {
        accesser_device_id: map.get(ACCESSER_DEVICE_ID)?.clone(),
        accesser_user_id: param(map, ACCESSER_USER_ID)?,
        accesser_account_id: map.get(ACCESSER_ACCOUNT_ID)?.clone(),
        accesser_token_id: param(map, ACCESSER_TOKEN_ID)?,
        accessee_device_id: map.get(ACCESSEE_DEVICE_ID)?.clone(),
        ..Default::default()
    };

    let accessee = (
        map.get(ACCESSEE_ACCOUNT_ID),
        param::<i32>(map, ACCESSEE_USER_ID),
        param::<i64>(map, ACCESSEE_TOKEN_ID),
    );
    if let (Some(account_id), Some(user_id), Some(token_id)) = accessee {
        query.accessee_account_id = account_id.clone();
        query.accessee_user_id = user_id;
        query.accessee_token_id = token_id;
        return Some((QueryType::AcerAndAceeTokenId, query));
    }
    Some((QueryType::AcerTokenId, query))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn trust_device_params_prefer_user_and_bundle() {
        let lookup = lookup_from_params(&map(&[
            ("trustDeviceId", "peer"),
            ("status", "1"),
            ("userId", "100"),
            ("bundleName", "com.example"),
            ("tokenId", "7"),
        ]));
        assert!(matches!(
            lookup,
            Some(AclLookup::UserBundleTrustDevice { user_id: 100, .. })
        ));
    }

    #[test]
    fn token_params_need_trust_device_and_status() {
        let lookup = lookup_from_params(&map(&[
            ("trustDeviceId", "peer"),
            ("status", "0"),
            ("tokenId", "7"),
        ]));
        assert_eq!(
            lookup,
            Some(AclLookup::TokenTrustDevice {
                token_id: 7,
                trust_device_id: "peer".into(),
                status: Status::Inactive,
            })
        );
    }

    #[test]
    fn unparsable_status_falls_through_to_user() {
        let lookup = lookup_from_params(&map(&[
            ("trustDeviceId", "peer"),
            ("status", "active"),
            ("userId", "100"),
        ]));
        assert_eq!(lookup, Some(AclLookup::User { user_id: 100 }));
    }

    #[test]
    fn bind_type_params() {
        let lookup = lookup_from_params(&map(&[
            ("bindType", "256"),
            ("status", "1"),
            ("bundleName", "com.example"),
        ]));
        assert_eq!(
            lookup,
            Some(AclLookup::BundleBindType {
                bundle_name: "com.example".into(),
                bind_type: BindType::PointToPoint,
                status: Status::Active,
            })
        );
    }

    #[test]
    fn user_and_account_params() {
        let lookup = lookup_from_params(&map(&[("userId", "100"), ("accountId", "acct")]));
        assert!(matches!(lookup, Some(AclLookup::UserAccount { .. })));
    }

    #[test]
    fn query_params_choose_query_type() {
        let acer_only = map(&[
            ("accesserDeviceId", "devX"),
            ("accesserUserId", "100"),
            ("accesserAccountId", "acct"),
            ("accesserTokenId", "11"),
            ("accesseeDeviceId", "devY"),
        ]);
        assert!(matches!(
            lookup_from_params(&acer_only),
            Some(AclLookup::Query {
                query_type: QueryType::AcerTokenId,
                ..
            })
        ));

        let mut both = acer_only.clone();
        both.extend(map(&[
            ("accesseeUserId", "200"),
            ("accesseeAccountId", "acct"),
            ("accesseeTokenId", "22"),
        ]));
        let Some(AclLookup::Query { query_type, query }) = lookup_from_params(&both) else {
            panic!("expected a query lookup");
        };
        assert_eq!(query_type, QueryType::AcerAndAceeTokenId);
        assert_eq!(query.accessee_token_id, 22);
    }

    #[test]
    fn incomplete_params_are_rejected() {
        assert_eq!(lookup_from_params(&map(&[("bundleName", "x")])), None);
        assert_eq!(
            lookup_from_params(&map(&[("accesserDeviceId", "devX"), ("accesseeDeviceId", "devY")])),
            None
        );
    }

    #[test]
    fn account_wide_grants_ignore_bundle_and_token() {
        let mut acl = AccessControlProfile {
            bind_type: BindType::SameAccount,
            ..Default::default()
        };
        acl.accesser.user_id = 100;
        acl.accesser.device_id = "peer".into();
        assert!(owned_by_user_and_bundle(&acl, 100, "anything"));
        assert!(owned_by_bundle(&acl, "anything"));
        assert!(links_token_to_device(&acl, 999, "peer"));

        acl.bind_type = BindType::PointToPoint;
        acl.bind_level = BindLevel::App;
        assert!(!owned_by_bundle(&acl, "anything"));
        assert!(!links_token_to_device(&acl, 999, "peer"));
        acl.accessee.token_id = 999;
        assert!(links_token_to_device(&acl, 999, "peer"));
    }
}
