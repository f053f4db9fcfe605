//! Capability queries.
//!
//! A [`DeviceQuery`] pairs a management command with the parser for its
//! reply. New kinds of telemetry are added by implementing the trait; the
//! session abstraction does not change.

use serde_json::Value;

use super::traits::{DeviceError, DeviceSession, Record};

/// A typed command that can be issued on any [`DeviceSession`].
pub trait DeviceQuery: Send + Sync {
    /// Parsed result.
    type Output: Send;

    /// Command path, e.g. `/system/resource/print`.
    fn command(&self) -> &str;

    /// Turn reply records into the result.
    fn parse(&self, records: Vec<Record>) -> Result<Self::Output, DeviceError>;
}

/// Single-record snapshot of CPU load, memory, uptime and similar.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResources;

impl DeviceQuery for SystemResources {
    type Output = Value;

    fn command(&self) -> &str {
        "/system/resource/print"
    }

    fn parse(&self, records: Vec<Record>) -> Result<Value, DeviceError> {
        records
            .into_iter()
            .next()
            .map(Value::Object)
            .ok_or_else(|| DeviceError::EmptyReply(self.command().to_string()))
    }
}

/// One document per network interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interfaces;

impl DeviceQuery for Interfaces {
    type Output = Vec<Value>;

    fn command(&self) -> &str {
        "/interface/print"
    }

    fn parse(&self, records: Vec<Record>) -> Result<Vec<Value>, DeviceError> {
        Ok(records.into_iter().map(Value::Object).collect())
    }
}

impl<'a> dyn DeviceSession + 'a {
    /// Issue a typed query.
    pub async fn query<Q: DeviceQuery>(&mut self, query: &Q) -> Result<Q::Output, DeviceError> {
        let records = self.run_command(query.command(), &[]).await?;
        query.parse(records)
    }

    /// `/system/resource/print`, first record.
    pub async fn system_resources(&mut self) -> Result<Value, DeviceError> {
        self.query(&SystemResources).await
    }

    /// `/interface/print`, all records.
    pub async fn interfaces(&mut self) -> Result<Vec<Value>, DeviceError> {
        self.query(&Interfaces).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Scripted {
        calls: Vec<String>,
    }

    #[async_trait]
    impl DeviceSession for Scripted {
        async fn run_command(
            &mut self,
            command: &str,
            _args: &[(&str, &str)],
        ) -> Result<Vec<Record>, DeviceError> {
            self.calls.push(command.to_string());
            let records = match command {
                "/system/resource/print" => vec![json!({"cpu-load": "5", "uptime": "2m"})],
                "/interface/print" => vec![json!({"name": "ether1"}), json!({"name": "ether2"})],
                _ => vec![],
            };
            Ok(records
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect())
        }

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn test_session_queries_in_order() {
        let mut scripted = Scripted { calls: Vec::new() };
        {
            let session: &mut dyn DeviceSession = &mut scripted;
            let resources = session.system_resources().await.unwrap();
            assert_eq!(resources["cpu-load"], "5");

            let interfaces = session.interfaces().await.unwrap();
            assert_eq!(interfaces.len(), 2);
            assert_eq!(interfaces[1]["name"], "ether2");
        }
        assert_eq!(scripted.calls, ["/system/resource/print", "/interface/print"]);
    }

    #[test]
    fn test_system_resources_requires_a_record() {
        let err = SystemResources.parse(Vec::new()).unwrap_err();
        assert!(matches!(err, DeviceError::EmptyReply(_)));
    }

    #[test]
    fn test_interfaces_accepts_empty_reply() {
        assert!(Interfaces.parse(Vec::new()).unwrap().is_empty());
    }
}
