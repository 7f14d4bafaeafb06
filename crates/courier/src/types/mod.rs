mod agent_uri;
mod endpoint_uri;
mod node_id;
mod tenant_id;

pub use agent_uri::AgentUri;
pub use endpoint_uri::{EndpointUri, UriError};
pub use node_id::{NodeId, NodeIdentity};
pub use tenant_id::TenantId;

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! serde_round_trip {
        ($name:ident, $val:expr) => {
            mod $name {
                use super::*;

                #[test]
                fn msgpack() {
                    let val = $val;
                    let bytes = rmp_serde::to_vec_named(&val).unwrap();
                    let decoded = rmp_serde::from_slice(&bytes).unwrap();
                    assert_eq!(val, decoded);
                }

                #[test]
                fn json() {
                    let val = $val;
                    let json = serde_json::to_string(&val).unwrap();
                    let decoded = serde_json::from_str(&json).unwrap();
                    assert_eq!(val, decoded);
                }
            }
        };
    }

    serde_round_trip!(node_id, NodeId::new(42));
    serde_round_trip!(tenant_id, TenantId::new("tenant-a"));
    serde_round_trip!(endpoint_uri, EndpointUri::new("local://orders"));
    serde_round_trip!(
        agent_uri,
        AgentUri::new("courier-durability", "store", "main")
    );

    #[test]
    fn endpoint_uri_serializes_as_plain_string() {
        let json = serde_json::to_string(&EndpointUri::new("local://a")).unwrap();
        assert_eq!(json, "\"local://a\"");
    }
}
