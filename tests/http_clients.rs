//! HTTP clients against mock servers.

use chat_digest::chatlog::{self, ChatlogClient};
use chat_digest::completion::OpenAiCompletionClient;
use chat_digest::config::{ChatlogConfig, CompletionConfig, FeishuConfig};
use chat_digest::feishu::FeishuClient;
use chat_digest::traits::{
    ChatSource, CompletionClient, CompletionRequest, MediaUpload, TabularStore, UploadParent,
};
use chat_digest_core::models::MediaKind;
use chrono::NaiveDate;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 5, 27).unwrap()
}

fn chatlog_config(server: &MockServer) -> ChatlogConfig {
    ChatlogConfig {
        base_url: server.uri(),
        ..ChatlogConfig::default()
    }
}

fn completion_config(server: &MockServer) -> CompletionConfig {
    CompletionConfig {
        provider: "custom".into(),
        model: "test-model".into(),
        base_url: Some(server.uri()),
        api_key: Some("sk-test".into()),
        timeout_secs: 5,
        max_retries: 2,
    }
}

fn feishu_config(server: &MockServer) -> FeishuConfig {
    FeishuConfig {
        app_id: "cli_test".into(),
        app_secret: Some("secret".into()),
        api_base: server.uri(),
        web_base: "https://example.feishu.cn/base".into(),
        folder_token: String::new(),
        timeout_secs: 5,
    }
}

fn request() -> CompletionRequest {
    CompletionRequest {
        system: "system".into(),
        user: "user".into(),
        temperature: 0.1,
        max_tokens: 100,
    }
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/auth/v3/tenant_access_token/internal"))
        .and(body_partial_json(json!({"app_id": "cli_test", "app_secret": "secret"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "msg": "ok",
            "tenant_access_token": "t-abc",
            "expire": 7200
        })))
        .expect(1)
        .mount(server)
        .await;
}

// ─── Chat log ───────────────────────────────────────────────────────

#[tokio::test]
async fn chatlog_reads_bare_array() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/chatlog"))
        .and(query_param("talker", "123@chatroom"))
        .and(query_param("time", "2025-05-27"))
        .and(query_param("format", "json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"seq": 1, "type": 1, "sender": "wxid_a", "senderName": "Alice", "content": "hi"},
            {"seq": 2, "type": 3, "sender": "wxid_b", "content": "", "contents": {"md5": "abc"}},
            "not a message"
        ])))
        .mount(&server)
        .await;

    let client = ChatlogClient::new(&chatlog_config(&server)).unwrap();
    let messages = client.fetch_messages("123@chatroom", day()).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].sender_name.as_deref(), Some("Alice"));
    assert_eq!(
        messages[1].contents.as_ref().and_then(|c| c.md5.as_deref()),
        Some("abc")
    );
}

#[tokio::test]
async fn chatlog_reads_items_wrapper() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/chatlog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"seq": 9, "type": 1, "content": "wrapped"}]
        })))
        .mount(&server)
        .await;

    let client = ChatlogClient::new(&chatlog_config(&server)).unwrap();
    let messages = client.fetch_messages("x", day()).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content.as_deref(), Some("wrapped"));
}

#[tokio::test]
async fn chatlog_lists_chatrooms() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/chatroom"))
        .and(query_param("format", "json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"name": "111@chatroom", "nickName": "Rust Club", "users": []},
                {"name": "wxid_plain"}
            ]
        })))
        .mount(&server)
        .await;

    let client = ChatlogClient::new(&chatlog_config(&server)).unwrap();
    let rooms = client.list_chatrooms().await.unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].id, "111@chatroom");
    assert_eq!(rooms[0].display_name, "Rust Club");
}

#[tokio::test]
async fn chatlog_chatroom_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/chatroom"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&server)
        .await;

    let client = ChatlogClient::new(&chatlog_config(&server)).unwrap();
    let err = client.list_chatrooms().await.unwrap_err();
    assert!(err.to_string().contains("503"), "{}", err);
}

#[tokio::test]
async fn chatlog_range_skips_failed_days() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/chatlog"))
        .and(query_param("time", "2025-05-26"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/chatlog"))
        .and(query_param("time", "2025-05-27"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"seq": 1, "content": "ok"}])))
        .mount(&server)
        .await;

    let client = ChatlogClient::new(&chatlog_config(&server)).unwrap();
    let from = NaiveDate::from_ymd_opt(2025, 5, 26).unwrap();
    let messages = chatlog::fetch_range(&client, "x", from, day()).await.unwrap();
    assert_eq!(messages.len(), 1);

    let only_bad_day = chatlog::fetch_range(&client, "x", from, from).await;
    assert!(only_bad_day.is_err());
}

#[tokio::test]
async fn chatlog_downloads_media_with_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/image/abc123"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/png")
                .set_body_bytes(vec![0x89, 0x50, 0x4E, 0x47]),
        )
        .mount(&server)
        .await;

    let client = ChatlogClient::new(&chatlog_config(&server)).unwrap();
    let payload = client.fetch_media(MediaKind::Image, "abc123").await.unwrap();
    assert_eq!(payload.bytes.len(), 4);
    assert_eq!(payload.content_type.as_deref(), Some("image/png"));

    assert!(client.fetch_media(MediaKind::Video, "missing").await.is_err());
}

// ─── Completion ─────────────────────────────────────────────────────

#[tokio::test]
async fn completion_retries_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "test-model", "max_tokens": 100})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {"role": "assistant", "content": "{\"ok\": true}"},
                "finish_reason": "stop"
            }]
        })))
        .mount(&server)
        .await;

    let client = OpenAiCompletionClient::new(&completion_config(&server))
        .unwrap()
        .with_backoff_unit(Duration::from_millis(5));
    let completion = client.complete(&request()).await.unwrap();
    assert_eq!(completion.text, "{\"ok\": true}");
    assert!(!completion.is_truncated());
}

#[tokio::test]
async fn completion_fails_fast_on_client_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad model"))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiCompletionClient::new(&completion_config(&server))
        .unwrap()
        .with_backoff_unit(Duration::from_millis(5));
    let err = client.complete(&request()).await.unwrap_err();
    assert!(err.to_string().contains("400"));
}

#[tokio::test]
async fn completion_gives_up_after_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let client = OpenAiCompletionClient::new(&completion_config(&server))
        .unwrap()
        .with_backoff_unit(Duration::from_millis(1));
    assert!(client.complete(&request()).await.is_err());
}

// ─── Feishu ─────────────────────────────────────────────────────────

#[tokio::test]
async fn feishu_creates_base_and_table_with_cached_token() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/bitable/v1/apps"))
        .and(header("authorization", "Bearer t-abc"))
        .and(body_partial_json(json!({"name": "Team 2025-05-27"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0, "msg": "success", "data": {"app": {"app_token": "bascn123"}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bitable/v1/apps/bascn123/tables"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0, "msg": "success", "data": {"table_id": "tbl9"}
        })))
        .mount(&server)
        .await;

    let client = FeishuClient::new(&feishu_config(&server)).unwrap();
    let app_token = client.create_base("Team 2025-05-27").await.unwrap();
    assert_eq!(app_token, "bascn123");
    let schema = chat_digest::feishu::export_table_schema("Chat log");
    let table_id = client.create_table(&app_token, &schema).await.unwrap();
    assert_eq!(table_id, "tbl9");
    assert_eq!(client.base_url(&app_token), "https://example.feishu.cn/base/bascn123");
}

#[tokio::test]
async fn feishu_nonzero_code_is_an_error() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/bitable/v1/apps"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 1254302, "msg": "permission denied"
        })))
        .mount(&server)
        .await;

    let client = FeishuClient::new(&feishu_config(&server)).unwrap();
    let err = client.create_base("x").await.unwrap_err();
    assert!(format!("{:#}", err).contains("1254302"));
}

#[tokio::test]
async fn feishu_bad_credentials_fail_check() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v3/tenant_access_token/internal"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 10014, "msg": "app secret invalid"
        })))
        .mount(&server)
        .await;

    let client = FeishuClient::new(&feishu_config(&server)).unwrap();
    let err = client.check_credentials().await.unwrap_err();
    assert!(format!("{:#}", err).contains("app secret invalid"));
}

#[tokio::test]
async fn feishu_uploads_media() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/drive/v1/medias/upload_all"))
        .and(header("authorization", "Bearer t-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0, "msg": "success", "data": {"file_token": "boxcnFILE"}
        })))
        .mount(&server)
        .await;

    let client = FeishuClient::new(&feishu_config(&server)).unwrap();
    let token = client
        .upload_media(
            "bascn123",
            MediaUpload {
                file_name: "image_1.jpg".into(),
                content_type: "image/jpeg".into(),
                parent: UploadParent::Image,
                bytes: vec![1, 2, 3],
            },
        )
        .await
        .unwrap();
    assert_eq!(token, "boxcnFILE");
}

#[tokio::test]
async fn feishu_owner_lookup_and_transfer() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path("/application/v6/applications/cli_test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0, "msg": "success",
            "data": {"app": {"owner": {"owner_id": "ou_42", "type": 2}}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/drive/v1/permissions/bascn123/members/transfer_owner"))
        .and(query_param("type", "bitable"))
        .and(body_partial_json(json!({"member_type": "openid", "member_id": "ou_42"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "msg": "success"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = FeishuClient::new(&feishu_config(&server)).unwrap();
    let owner = client.get_app_owner(client.app_id()).await.unwrap();
    assert_eq!(owner, "ou_42");
    client.transfer_ownership("bascn123", &owner).await.unwrap();
}

#[tokio::test]
async fn feishu_refreshes_rejected_token_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v3/tenant_access_token/internal"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0, "tenant_access_token": "t-abc", "expire": 7200
        })))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bitable/v1/apps"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 99991663, "msg": "Invalid access token for authorization"
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bitable/v1/apps"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0, "data": {"app": {"app_token": "bascn777"}}
        })))
        .mount(&server)
        .await;

    let client = FeishuClient::new(&feishu_config(&server)).unwrap();
    assert_eq!(client.create_base("x").await.unwrap(), "bascn777");
}
