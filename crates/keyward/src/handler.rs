use crate::protocol::{DecryptRequest, EncryptReply, EncryptRequest, ErrorCode, Request, Response};
use keyward_crypto::{KeyStore, PrivateKey, decrypt_symmetric_key, decrypt_value, encrypt_value};
use std::sync::Arc;

/// State shared by every connection served by one agent server.
pub(crate) struct AgentState {
    /// Key supplied at startup; takes precedence over the key store.
    private_key: Option<PrivateKey>,
    keys: Arc<KeyStore>,
}

impl AgentState {
    pub(crate) fn new(keys: Arc<KeyStore>, private_key: Option<PrivateKey>) -> Arc<Self> {
        Arc::new(Self { private_key, keys })
    }

    fn private_key(&self) -> Result<PrivateKey, Response> {
        match &self.private_key {
            Some(key) => Ok(key.clone()),
            None => self
                .keys
                .load_private_key_lazy()
                .map_err(|e| Response::error(ErrorCode::KeyUnavailable, format!("{e:#}"))),
        }
    }
}

/// Handle a single request. Cryptographic work runs on the blocking pool; a
/// panicking handler is reported to the caller instead of tearing anything down.
pub(crate) async fn handle_request(state: &Arc<AgentState>, req: Request) -> Response {
    let state = state.clone();
    let kind = req.message_type();
    let result = tokio::task::spawn_blocking(move || match req {
        Request::Ping => Response::ok(serde_json::Value::Null),
        Request::Decrypt(req) => handle_decrypt(&state, req),
        Request::Encrypt(req) => handle_encrypt(&state, req),
    })
    .await;

    match result {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(request = %kind, err = %e, "request handler crashed");
            Response::error(ErrorCode::Internal, format!("{kind} handler crashed"))
        }
    }
}

fn handle_decrypt(state: &AgentState, req: DecryptRequest) -> Response {
    let private_key = match state.private_key() {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    let result = decrypt_symmetric_key(&req.symmetric_key, &private_key)
        .and_then(|key| decrypt_value(&req.ciphertext, &key));
    match result {
        Ok(value) => Response::ok(value),
        Err(e) => Response::error(ErrorCode::HandlerFailed, format!("{e:#}")),
    }
}

fn handle_encrypt(state: &AgentState, req: EncryptRequest) -> Response {
    let private_key = match state.private_key() {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    let result = decrypt_symmetric_key(&req.symmetric_key, &private_key)
        .and_then(|key| encrypt_value(&req.value, &key));
    match result {
        Ok(ciphertext) => match serde_json::to_value(EncryptReply { ciphertext }) {
            Ok(data) => Response::ok(data),
            Err(e) => Response::error(ErrorCode::Internal, e.to_string()),
        },
        Err(e) => Response::error(ErrorCode::HandlerFailed, format!("{e:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use zeroize::Zeroizing;

    fn store() -> (tempfile::TempDir, Arc<KeyStore>) {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore::open(dir.path(), Some(Zeroizing::new("hunter2".into())));
        keys.init().unwrap();
        (dir, Arc::new(keys))
    }

    fn ok_data(resp: Response) -> serde_json::Value {
        match resp {
            Response::Ok { data } => data,
            other => panic!("expected ok, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_replies_ok_without_data() {
        let (_dir, keys) = store();
        let state = AgentState::new(keys, None);
        assert_eq!(
            handle_request(&state, Request::Ping).await,
            Response::ok(serde_json::Value::Null)
        );
    }

    #[tokio::test]
    async fn encrypt_then_decrypt() {
        let (_dir, keys) = store();
        let key_ref = keys.latest_key_ref().unwrap();
        let state = AgentState::new(keys, None);

        let value = json!({ "token": "abc", "n": [1, 2, 3] });
        let data = ok_data(
            handle_request(
                &state,
                Request::Encrypt(EncryptRequest {
                    value: value.clone(),
                    symmetric_key: key_ref.clone(),
                }),
            )
            .await,
        );
        let reply: EncryptReply = serde_json::from_value(data).unwrap();

        let decrypted = ok_data(
            handle_request(
                &state,
                Request::Decrypt(DecryptRequest {
                    ciphertext: reply.ciphertext,
                    symmetric_key: key_ref,
                }),
            )
            .await,
        );
        assert_eq!(decrypted, value);
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_handler_failure() {
        let (_dir, keys) = store();
        let key_ref = keys.latest_key_ref().unwrap();
        let state = AgentState::new(keys, None);
        let resp = handle_request(
            &state,
            Request::Decrypt(DecryptRequest {
                ciphertext: format!("kw1:{}:AAAAAAAAAAAAAAAAAAAAAAAAAAAA", key_ref.revision),
                symmetric_key: key_ref,
            }),
        )
        .await;
        assert!(matches!(
            resp,
            Response::Error {
                code: ErrorCode::HandlerFailed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn missing_passphrase_is_key_unavailable() {
        let (dir, keys) = store();
        let key_ref = keys.latest_key_ref().unwrap();
        let locked = Arc::new(KeyStore::open(dir.path(), None));
        let state = AgentState::new(locked, None);
        let resp = handle_request(
            &state,
            Request::Encrypt(EncryptRequest {
                value: json!(1),
                symmetric_key: key_ref,
            }),
        )
        .await;
        assert!(matches!(
            resp,
            Response::Error {
                code: ErrorCode::KeyUnavailable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn override_key_is_used_over_store() {
        let (_dir, keys) = store();
        let key_ref = keys.latest_key_ref().unwrap();
        let state = AgentState::new(keys, Some(PrivateKey::generate()));
        let resp = handle_request(
            &state,
            Request::Encrypt(EncryptRequest {
                value: json!("x"),
                symmetric_key: key_ref,
            }),
        )
        .await;
        match resp {
            Response::Error { code, message } => {
                assert_eq!(code, ErrorCode::HandlerFailed);
                assert!(message.contains("wrong agent key"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }
}
