//! Bidirectional ACL matching
//!
//! A [`QueryProfile`] describes the caller's view of a relationship
//! (accesser = "me", accessee = "them"). The ledger may have recorded the
//! same relationship in either direction, so each query type has a forward
//! predicate and a reverse predicate with the sides swapped.
//!
//! User ids on the ACL side compare equal to anything when they hold one of
//! the two wildcard sentinels.

use super::enums::{BindLevel, BindType, QueryType, Status};
use super::trust::{AccessControlProfile, QueryProfile, DEFAULT_USER_ID, DEFAULT_USER_ID_EXTRA};

fn user_matches(acl_user: i32, query_user: i32) -> bool {
    acl_user == query_user || acl_user == DEFAULT_USER_ID || acl_user == DEFAULT_USER_ID_EXTRA
}

fn is_user_level(acl: &AccessControlProfile) -> bool {
    acl.bind_level == BindLevel::User
}

/// Forward match with both identities known
pub fn forward_by_acer_and_acee(query: &QueryProfile, acl: &AccessControlProfile) -> bool {
    if acl.accesser.device_id != query.accesser_device_id
        || acl.accessee.device_id != query.accessee_device_id
        || acl.status != Status::Active
    {
        return false;
    }
    if !user_matches(acl.accesser.user_id, query.accesser_user_id)
        || !user_matches(acl.accessee.user_id, query.accessee_user_id)
    {
        return false;
    }
    let same_account = acl.bind_type == BindType::SameAccount
        && acl.accesser.account_id == query.accesser_account_id
        && acl.accessee.account_id == query.accessee_account_id;
    if same_account || is_user_level(acl) {
        return true;
    }
    acl.accesser.token_id == query.accesser_token_id
        && acl.accessee.token_id == query.accessee_token_id
}

/// Reverse match with both identities known
pub fn reverse_by_acer_and_acee(query: &QueryProfile, acl: &AccessControlProfile) -> bool {
    if acl.accesser.device_id != query.accessee_device_id
        || acl.accessee.device_id != query.accesser_device_id
        || acl.status != Status::Active
    {
        return false;
    }
    if !user_matches(acl.accesser.user_id, query.accessee_user_id)
        || !user_matches(acl.accessee.user_id, query.accesser_user_id)
    {
        return false;
    }
    let same_account = acl.bind_type == BindType::SameAccount
        && acl.accesser.account_id == query.accessee_account_id
        && acl.accessee.account_id == query.accesser_account_id;
    if same_account || is_user_level(acl) {
        return true;
    }
    acl.accesser.token_id == query.accessee_token_id
        && acl.accessee.token_id == query.accesser_token_id
}

/// Forward match when only the accesser identity is known
pub fn forward_by_acer(query: &QueryProfile, acl: &AccessControlProfile) -> bool {
    if acl.accesser.device_id != query.accesser_device_id
        || acl.accessee.device_id != query.accessee_device_id
        || acl.status != Status::Active
    {
        return false;
    }
    if !user_matches(acl.accesser.user_id, query.accesser_user_id) {
        return false;
    }
    let same_account = acl.bind_type == BindType::SameAccount
        && acl.accesser.account_id == query.accesser_account_id;
    if same_account || is_user_level(acl) {
        return true;
    }
    acl.accesser.token_id == query.accesser_token_id
}

/// Reverse match when only the accesser identity is known
///
/// The query's accesser is compared against the ACL's accessee.
pub fn reverse_by_acer(query: &QueryProfile, acl: &AccessControlProfile) -> bool {
    if acl.accesser.device_id != query.accessee_device_id
        || acl.accessee.device_id != query.accesser_device_id
        || acl.status != Status::Active
    {
        return false;
    }
    if !user_matches(acl.accessee.user_id, query.accesser_user_id) {
        return false;
    }
    let same_account = acl.bind_type == BindType::SameAccount
        && acl.accessee.account_id == query.accesser_account_id;
    if same_account || is_user_level(acl) {
        return true;
    }
    acl.accessee.token_id == query.accesser_token_id
}

/// Whether `acl` answers `query` for the given query type
///
/// The ACL's trusted device must be one of the two devices named by the query.
pub fn matches_query(query_type: QueryType, query: &QueryProfile, acl: &AccessControlProfile) -> bool {
    if acl.trust_device_id != query.accessee_device_id
        && acl.trust_device_id != query.accesser_device_id
    {
        return false;
    }
    match query_type {
        QueryType::AcerAndAceeTokenId => {
            forward_by_acer_and_acee(query, acl) || reverse_by_acer_and_acee(query, acl)
        }
        QueryType::AcerTokenId => forward_by_acer(query, acl) || reverse_by_acer(query, acl),
    }
}

/// Drops topology-only rows from a result set
pub fn remove_lnn_acl(profiles: &mut Vec<AccessControlProfile>) {
    profiles.retain(|p| !p.is_lnn_acl());
}

/// Aggregate status for a peer: active iff any non-LNN ACL is active
pub fn aggregate_status<'a, I>(profiles: I) -> Status
where
    I: IntoIterator<Item = &'a AccessControlProfile>,
{
    let any_active = profiles
        .into_iter()
        .any(|p| !p.is_lnn_acl() && p.status == Status::Active);
    if any_active {
        Status::Active
    } else {
        Status::Inactive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trust::{Accessee, Accesser};

    fn same_account_acl() -> AccessControlProfile {
        AccessControlProfile {
            access_control_id: 1,
            trust_device_id: "devY".into(),
            bind_type: BindType::SameAccount,
            bind_level: BindLevel::Service,
            status: Status::Active,
            accesser: Accesser {
                device_id: "devX".into(),
                user_id: 100,
                account_id: "acct".into(),
                token_id: 11,
                ..Default::default()
            },
            accessee: Accessee {
                device_id: "devY".into(),
                user_id: 200,
                account_id: "acct".into(),
                token_id: 22,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn query(acer_dev: &str, acer_user: i32, acee_dev: &str, acee_user: i32) -> QueryProfile {
        QueryProfile {
            accesser_device_id: acer_dev.into(),
            accesser_user_id: acer_user,
            accesser_account_id: "acct".into(),
            accesser_token_id: 0,
            accessee_device_id: acee_dev.into(),
            accessee_user_id: acee_user,
            accessee_account_id: "acct".into(),
            accessee_token_id: 0,
        }
    }

    #[test]
    fn forward_and_reverse_match_same_row() {
        let acl = same_account_acl();
        let forward = query("devX", 100, "devY", 200);
        assert!(forward_by_acer_and_acee(&forward, &acl));
        assert!(matches_query(QueryType::AcerAndAceeTokenId, &forward, &acl));

        let reverse = query("devY", 200, "devX", 100);
        assert!(!forward_by_acer_and_acee(&reverse, &acl));
        assert!(reverse_by_acer_and_acee(&reverse, &acl));
        assert!(matches_query(QueryType::AcerAndAceeTokenId, &reverse, &acl));
    }

    #[test]
    fn wildcard_user_ids_match_anything() {
        let mut acl = same_account_acl();
        acl.accesser.user_id = DEFAULT_USER_ID;
        acl.accessee.user_id = DEFAULT_USER_ID_EXTRA;
        assert!(forward_by_acer_and_acee(&query("devX", 7, "devY", 8), &acl));
    }

    #[test]
    fn inactive_rows_never_match() {
        let mut acl = same_account_acl();
        acl.status = Status::Inactive;
        assert!(!matches_query(
            QueryType::AcerAndAceeTokenId,
            &query("devX", 100, "devY", 200),
            &acl
        ));
    }

    #[test]
    fn token_ids_required_without_account_shortcut() {
        let mut acl = same_account_acl();
        acl.bind_type = BindType::PointToPoint;
        let mut q = query("devX", 100, "devY", 200);
        assert!(!forward_by_acer_and_acee(&q, &acl));
        q.accesser_token_id = 11;
        q.accessee_token_id = 22;
        assert!(forward_by_acer_and_acee(&q, &acl));
    }

    #[test]
    fn user_level_binding_skips_token_check() {
        let mut acl = same_account_acl();
        acl.bind_type = BindType::PointToPoint;
        acl.bind_level = BindLevel::User;
        assert!(forward_by_acer(&query("devX", 100, "devY", 0), &acl));
    }

    #[test]
    fn acer_only_reverse_compares_accessee_side() {
        let mut acl = same_account_acl();
        acl.bind_type = BindType::PointToPoint;
        let mut q = query("devY", 200, "devX", 0);
        q.accesser_token_id = 22;
        assert!(reverse_by_acer(&q, &acl));
        assert!(matches_query(QueryType::AcerTokenId, &q, &acl));
    }

    #[test]
    fn trust_device_must_be_named_by_query() {
        let mut acl = same_account_acl();
        acl.trust_device_id = "devZ".into();
        assert!(!matches_query(
            QueryType::AcerAndAceeTokenId,
            &query("devX", 100, "devY", 200),
            &acl
        ));
    }

    #[test]
    fn aggregation_ignores_lnn_rows() {
        let mut lnn = same_account_acl();
        lnn.extra_data = r#"{"IsLnnAcl":"true"}"#.into();
        let mut inactive = same_account_acl();
        inactive.status = Status::Inactive;

        assert_eq!(aggregate_status([&lnn, &inactive]), Status::Inactive);
        assert_eq!(
            aggregate_status([&same_account_acl(), &inactive]),
            Status::Active
        );

        let mut rows = vec![lnn, inactive];
        remove_lnn_acl(&mut rows);
        assert_eq!(rows.len(), 1);
    }
}
