use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Channel membership as reported by `getChatMember`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
    Unknown,
}

impl MembershipStatus {
    /// Total: anything unrecognized is `Unknown`.
    pub fn from_status(status: &str) -> Self {
        match status {
            "creator" => Self::Creator,
            "administrator" => Self::Administrator,
            "member" => Self::Member,
            "restricted" => Self::Restricted,
            "left" => Self::Left,
            "kicked" => Self::Kicked,
            _ => Self::Unknown,
        }
    }

    pub fn is_subscribed(self) -> bool {
        matches!(self, Self::Creator | Self::Administrator | Self::Member)
    }
}

/// Answers "is this user currently in the gated channel?"
#[async_trait]
pub trait SubscriptionOracle: Send + Sync {
    async fn lookup(&self, user_id: u64) -> Result<MembershipStatus>;
}

#[derive(Debug, Deserialize)]
struct GetChatMemberResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Option<ChatMember>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    #[serde(default)]
    status: Option<String>,
}

/// Reduce a raw `getChatMember` body to a status.
///
/// Bot API refusals (`ok: false`, e.g. "user not found") mean the user is not
/// a member and map to `Unknown`. Only an unparseable body is an error.
fn parse_member_response(body: &str) -> Result<MembershipStatus> {
    let response: GetChatMemberResponse =
        serde_json::from_str(body).context("Failed to parse getChatMember response")?;

    if !response.ok {
        debug!(
            "getChatMember refused: {}",
            response.description.as_deref().unwrap_or("no description")
        );
    }

    Ok(response
        .result
        .and_then(|member| member.status)
        .map(|status| MembershipStatus::from_status(&status))
        .unwrap_or(MembershipStatus::Unknown))
}

/// Queries the Bot API `getChatMember` method for one fixed channel
pub struct ChannelMembershipOracle {
    client: reqwest::Client,
    endpoint: String,
    channel: String,
}

impl ChannelMembershipOracle {
    pub fn new(client: reqwest::Client, api_url: &str, bot_token: &str, channel: String) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/bot{}/getChatMember",
                api_url.trim_end_matches('/'),
                bot_token
            ),
            channel,
        }
    }
}

#[async_trait]
impl SubscriptionOracle for ChannelMembershipOracle {
    async fn lookup(&self, user_id: u64) -> Result<MembershipStatus> {
        let user_id = user_id.to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("chat_id", self.channel.as_str()), ("user_id", user_id.as_str())])
            .send()
            .await
            .context("Failed to send getChatMember request")?;

        // The Bot API answers 400 with a JSON body for unknown users, so the
        // body is parsed regardless of status.
        let body = response
            .text()
            .await
            .context("Failed to read getChatMember response")?;

        parse_member_response(&body)
    }
}
