// Authentication claims and list filtering
//
// Claims are extracted once per request (by the API layer) and carried in
// request scope. Filtering semantics are single-sourced here: admin role
// bypasses both the tenant and the program filter; a tenant filter drops
// resources without a tenant key; a program filter keeps resources without
// a program key so cross-cutting entities stay visible.

use serde::{Deserialize, Serialize};

use crate::value::{DataMap, DataMapExt};

pub const ROLE_ADMIN: &str = "admin";

/// Claims relevant to resource filtering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthClaims {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, rename = "tenantId")]
    pub tenant_id: Option<String>,
    #[serde(default, rename = "programIds")]
    pub program_ids: Vec<String>,
}

impl AuthClaims {
    pub fn admin() -> Self {
        Self {
            role: Some(ROLE_ADMIN.to_string()),
            tenant_id: None,
            program_ids: Vec::new(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ROLE_ADMIN)
    }

    /// Whether a resource's data passes the claim filters.
    pub fn permits(&self, data: &DataMap) -> bool {
        if self.is_admin() {
            return true;
        }

        if let Some(tenant) = &self.tenant_id {
            // Resources lacking the key are dropped while a tenant filter
            // is active.
            match data.get_str("tenantId") {
                Some(t) if t == tenant => {}
                _ => return false,
            }
        }

        if !self.program_ids.is_empty() {
            // Resources lacking the key are kept (cross-cutting entities).
            if let Some(program) = data.get_str("programId") {
                if !self.program_ids.iter().any(|p| p == program) {
                    return false;
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(tenant: Option<&str>, program: Option<&str>) -> DataMap {
        let mut data = DataMap::new();
        if let Some(t) = tenant {
            data.insert("tenantId".into(), json!(t));
        }
        if let Some(p) = program {
            data.insert("programId".into(), json!(p));
        }
        data
    }

    fn user_claims() -> AuthClaims {
        AuthClaims {
            role: Some("user".into()),
            tenant_id: Some("A".into()),
            program_ids: vec!["p1".into()],
        }
    }

    #[test]
    fn test_admin_bypasses_all_filters() {
        let claims = AuthClaims {
            role: Some("admin".into()),
            tenant_id: Some("A".into()),
            program_ids: vec!["p1".into()],
        };
        assert!(claims.permits(&resource(Some("B"), Some("p9"))));
        assert!(claims.permits(&resource(None, None)));
    }

    #[test]
    fn test_tenant_mismatch_dropped() {
        assert!(!user_claims().permits(&resource(Some("B"), Some("p1"))));
    }

    #[test]
    fn test_tenant_missing_dropped() {
        assert!(!user_claims().permits(&resource(None, Some("p1"))));
    }

    #[test]
    fn test_program_mismatch_dropped() {
        assert!(!user_claims().permits(&resource(Some("A"), Some("p2"))));
    }

    #[test]
    fn test_program_missing_kept() {
        assert!(user_claims().permits(&resource(Some("A"), None)));
    }

    #[test]
    fn test_no_filters_permit_everything() {
        let claims = AuthClaims {
            role: Some("user".into()),
            tenant_id: None,
            program_ids: Vec::new(),
        };
        assert!(claims.permits(&resource(Some("B"), Some("p9"))));
        assert!(claims.permits(&resource(None, None)));
    }
}
