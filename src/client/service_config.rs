//! Service configs: JSON documents, usually delivered by the resolver,
//! steering load balancing and per-method behavior.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// The prefix of DNS TXT records that carry service config choices, per
/// <https://github.com/grpc/proposal/blob/master/A2-service-configs-in-dns.md>.
const TXT_RECORD_PREFIX: &str = "grpc_config=";

/// The client language gate this implementation matches in TXT choices.
const CLIENT_LANGUAGE: &str = "rust";

/// An in-memory representation of a service config.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// An ordered list of load balancing policies. Each entry is a map with
    /// exactly one key, the policy name, whose value is that policy's config.
    #[serde(default)]
    pub load_balancing_config: Vec<HashMap<String, serde_json::Value>>,

    #[serde(default)]
    pub method_config: Vec<MethodConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MethodConfig {
    pub name: Vec<MethodConfigName>,
    #[serde(default)]
    pub wait_for_ready: Option<bool>,
    /// A duration rendered in the proto3 JSON form, e.g. `"1.5s"`.
    #[serde(default)]
    pub timeout: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MethodConfigName {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
}

impl ServiceConfig {
    /// Parses and validates a JSON service config. Unknown fields are
    /// tolerated; structural violations are not.
    pub fn from_json(json: &str) -> Result<ServiceConfig, String> {
        let config: ServiceConfig =
            serde_json::from_str(json).map_err(|e| format!("malformed service config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn from_value(value: &serde_json::Value) -> Result<ServiceConfig, String> {
        let config: ServiceConfig = serde_json::from_value(value.clone())
            .map_err(|e| format!("malformed service config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        for entry in &self.load_balancing_config {
            if entry.len() != 1 {
                return Err(format!(
                    "loadBalancingConfig entry must contain exactly one policy, found {}",
                    entry.len()
                ));
            }
        }
        for method_config in &self.method_config {
            if method_config.name.is_empty() {
                return Err("methodConfig entry with empty name list".to_owned());
            }
            for name in &method_config.name {
                if name.service.is_none() && name.method.is_some() {
                    return Err("methodConfig name with method but no service".to_owned());
                }
            }
            if let Some(timeout) = &method_config.timeout {
                parse_proto_duration(timeout)
                    .ok_or_else(|| format!("invalid methodConfig timeout {timeout:?}"))?;
            }
        }
        Ok(())
    }

    /// The configured policy names, in preference order.
    pub fn lb_policy_names(&self) -> impl Iterator<Item = &str> {
        self.load_balancing_config
            .iter()
            .flat_map(|entry| entry.keys())
            .map(String::as_str)
    }

    /// The config object for the named policy, if present.
    pub fn lb_policy_config(&self, name: &str) -> Option<&serde_json::Value> {
        self.load_balancing_config
            .iter()
            .find_map(|entry| entry.get(name))
    }

    /// The method config matching a full method path `/service/method`, most
    /// specific entry first: exact service+method, then service, then the
    /// wildcard entry.
    pub fn method_config(&self, path: &str) -> Option<&MethodConfig> {
        let mut parts = path.strip_prefix('/')?.splitn(2, '/');
        let service = parts.next()?;
        let method = parts.next()?;

        let matches = |name: &MethodConfigName, want_method: Option<&str>| {
            name.service.as_deref() == Some(service)
                && name.method.as_deref() == want_method
        };

        self.method_config
            .iter()
            .find(|mc| mc.name.iter().any(|n| matches(n, Some(method))))
            .or_else(|| {
                self.method_config
                    .iter()
                    .find(|mc| mc.name.iter().any(|n| matches(n, None)))
            })
            .or_else(|| {
                self.method_config.iter().find(|mc| {
                    mc.name
                        .iter()
                        .any(|n| n.service.is_none() && n.method.is_none())
                })
            })
    }
}

/// Parses proto3 JSON durations of the form `"<seconds>[.<fraction>]s"`.
pub(crate) fn parse_proto_duration(value: &str) -> Option<Duration> {
    let seconds = value.strip_suffix('s')?;
    let parsed: f64 = seconds.parse().ok()?;
    if !parsed.is_finite() || parsed < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(parsed))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigChoice {
    #[serde(default)]
    client_language: Option<Vec<String>>,
    #[serde(default)]
    percentage: Option<u32>,
    service_config: serde_json::Value,
}

/// Parses service config choices out of DNS TXT records and selects one.
///
/// `selection_percentage` is drawn uniformly in `0..100` once per resolver
/// and held for its lifetime, so the choice is stable across re-resolutions.
pub(crate) fn select_txt_service_config(
    records: &[String],
    selection_percentage: u32,
) -> Result<Option<ServiceConfig>, String> {
    let Some(record) = records.iter().find(|r| r.starts_with(TXT_RECORD_PREFIX)) else {
        return Ok(None);
    };
    let payload = &record[TXT_RECORD_PREFIX.len()..];
    let choices: Vec<ConfigChoice> = serde_json::from_str(payload)
        .map_err(|e| format!("malformed service config TXT record: {e}"))?;

    for choice in &choices {
        if let Some(languages) = &choice.client_language {
            if !languages.iter().any(|l| l.eq_ignore_ascii_case(CLIENT_LANGUAGE)) {
                continue;
            }
        }
        if let Some(percentage) = choice.percentage {
            if percentage > 100 {
                return Err(format!("service config percentage {percentage} out of range"));
            }
            if selection_percentage >= percentage {
                continue;
            }
        }
        return ServiceConfig::from_value(&choice.service_config).map(Some);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policies_and_methods() {
        let config = ServiceConfig::from_json(
            r#"{
                "loadBalancingConfig": [
                    {"round_robin": {}},
                    {"pick_first": {"shuffleAddressList": true}}
                ],
                "methodConfig": [{
                    "name": [{"service": "echo.Echo", "method": "UnaryEcho"}],
                    "waitForReady": true,
                    "timeout": "1.5s"
                }],
                "someFutureField": 3
            }"#,
        )
        .unwrap();

        let names: Vec<_> = config.lb_policy_names().collect();
        assert_eq!(names, vec!["round_robin", "pick_first"]);
        assert!(config.lb_policy_config("pick_first").is_some());

        let mc = config.method_config("/echo.Echo/UnaryEcho").unwrap();
        assert_eq!(mc.wait_for_ready, Some(true));
        assert_eq!(
            parse_proto_duration(mc.timeout.as_deref().unwrap()),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn rejects_multi_key_lb_entries() {
        let err = ServiceConfig::from_json(
            r#"{"loadBalancingConfig": [{"pick_first": {}, "round_robin": {}}]}"#,
        )
        .unwrap_err();
        assert!(err.contains("exactly one policy"), "{err}");
    }

    #[test]
    fn rejects_method_without_service() {
        let err = ServiceConfig::from_json(
            r#"{"methodConfig": [{"name": [{"method": "M"}]}]}"#,
        )
        .unwrap_err();
        assert!(err.contains("no service"), "{err}");
    }

    #[test]
    fn method_config_specificity() {
        let config = ServiceConfig::from_json(
            r#"{"methodConfig": [
                {"name": [{}], "timeout": "30s"},
                {"name": [{"service": "s"}], "timeout": "10s"},
                {"name": [{"service": "s", "method": "m"}], "timeout": "1s"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(config.method_config("/s/m").unwrap().timeout.as_deref(), Some("1s"));
        assert_eq!(config.method_config("/s/other").unwrap().timeout.as_deref(), Some("10s"));
        assert_eq!(config.method_config("/t/u").unwrap().timeout.as_deref(), Some("30s"));
    }

    #[test]
    fn txt_selection_respects_percentage() {
        let records = vec![format!(
            "grpc_config=[{}]",
            r#"{"percentage": 50, "serviceConfig": {"loadBalancingConfig": [{"round_robin": {}}]}}"#
        )];

        let chosen = select_txt_service_config(&records, 10).unwrap().unwrap();
        assert_eq!(chosen.lb_policy_names().collect::<Vec<_>>(), vec!["round_robin"]);

        assert_eq!(select_txt_service_config(&records, 50).unwrap(), None);
        assert_eq!(select_txt_service_config(&records, 99).unwrap(), None);
    }

    #[test]
    fn txt_selection_respects_client_language() {
        let records = vec![concat!(
            "grpc_config=[",
            r#"{"clientLanguage": ["go"], "serviceConfig": {"loadBalancingConfig": [{"round_robin": {}}]}},"#,
            r#"{"clientLanguage": ["rust"], "serviceConfig": {"loadBalancingConfig": [{"pick_first": {}}]}}"#,
            "]"
        )
        .to_owned()];

        let chosen = select_txt_service_config(&records, 0).unwrap().unwrap();
        assert_eq!(chosen.lb_policy_names().collect::<Vec<_>>(), vec!["pick_first"]);
    }

    #[test]
    fn txt_records_without_prefix_are_ignored() {
        let records = vec!["v=spf1 -all".to_owned()];
        assert_eq!(select_txt_service_config(&records, 0).unwrap(), None);
    }
}
