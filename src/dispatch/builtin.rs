//! Built-in command handlers

use bytes::Bytes;
use tracing::info;

use crate::client::Client;
use crate::command::Builtin;
use crate::error::{Error, Result};
use crate::fanout::CHANGES_TOPIC;
use crate::protocol::{Action, Value};

use super::Dispatcher;

fn arg(action: &Action, index: usize) -> Result<&Bytes> {
    action
        .args
        .get(index)
        .ok_or_else(|| Error::MalformedArguments(format!("{} is missing argument {}", action.command, index)))
}

fn text(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn list(items: Vec<Bytes>) -> Value {
    Value::List(items.into_iter().map(Value::Bytes).collect())
}

impl Dispatcher {
    pub(super) async fn run_builtin(&self, client: &Client, builtin: Builtin, action: &Action) -> Result<Value> {
        let key = &action.key;
        let fanout = &self.fanout;
        let secrets = &self.secrets;

        let value = match builtin {
            Builtin::Ping => Value::str("PONG"),

            Builtin::MAdd => {
                fanout.mon().add(client.id(), key.clone(), None);
                Value::ok()
            }
            Builtin::MRem => Value::Int(fanout.mon().remove(client.id(), key) as i64),

            Builtin::EAdd => {
                let label = text(arg(action, 0)?);
                fanout.ekg().add(client.id(), key.clone(), Some(label));
                Value::ok()
            }
            Builtin::ERem => Value::Int(fanout.ekg().remove(client.id(), key) as i64),
            Builtin::EMembers => Value::List(fanout.ekg().members_of(key).iter().map(|l| Value::str(l)).collect()),
            Builtin::ECard => Value::Int(fanout.ekg().cardinality_of(key) as i64),

            Builtin::Subscribe => {
                let topics: Vec<String> = action.args.iter().map(text).collect();
                Value::Int(fanout.pubsub().subscribe(client, &topics) as i64)
            }
            Builtin::Unsubscribe => {
                let topics: Vec<String> = action.args.iter().map(text).collect();
                Value::Int(fanout.pubsub().unsubscribe(client.id(), &topics) as i64)
            }
            Builtin::Publish => {
                let topic = arg(action, 0)?;
                let message = arg(action, 1)?;
                let event = Value::List(vec![
                    Value::str("MESSAGE"),
                    Value::Bytes(topic.clone()),
                    Value::Bytes(message.clone()),
                ]);
                Value::Int(fanout.pubsub().publish(event, &[text(topic)]) as i64)
            }

            Builtin::ListenAdd => {
                let endpoint = text(arg(action, 0)?);
                let added = self.listeners.lock().insert(endpoint.clone());
                if added {
                    info!(endpoint = %endpoint, "peer announced itself");
                }
                self.puller.ensure_client(&endpoint).await;
                Value::ok()
            }
            Builtin::ListenRem => {
                let endpoint = text(arg(action, 0)?);
                self.listeners.lock().remove(&endpoint);
                Value::Int(self.puller.close_client(&endpoint).await as i64)
            }
            Builtin::PullChanges => {
                fanout.pubsub().subscribe(client, &[CHANGES_TOPIC.to_string()]);
                Value::ok()
            }

            Builtin::GlobalSecrets => list(secrets.global()),
            Builtin::SetGlobalSecrets => {
                secrets.set_global(action.args.clone());
                Value::ok()
            }
            Builtin::GetSecrets => list(secrets.key_secrets(key)),
            Builtin::SetSecrets => {
                secrets.set_key_secrets(key.clone(), action.args.clone());
                Value::ok()
            }
            Builtin::AddSecret => Value::Int(secrets.add_key_secret(key.clone(), arg(action, 0)?.clone()) as i64),
            Builtin::RemSecret => Value::Int(secrets.remove_key_secret(key, arg(action, 0)?) as i64),
        };
        Ok(value)
    }
}
