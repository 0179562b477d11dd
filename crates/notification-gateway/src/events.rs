//! 社交活动事件定义
//!
//! 每个 topic 只承载一种事件类型，解码时由 topic 决定负载结构，不检查消息内容。
//! 字段名由上游生产者约定，必须保持兼容。

use std::fmt;
use std::str::FromStr;

use notify_shared::kafka::topics;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// 活动事件 topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Like,
    Post,
    Follow,
    Unfollow,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::Like, Topic::Post, Topic::Follow, Topic::Unfollow];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Like => topics::LIKE,
            Topic::Post => topics::POST,
            Topic::Follow => topics::FOLLOW,
            Topic::Unfollow => topics::UNFOLLOW,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            topics::LIKE => Ok(Topic::Like),
            topics::POST => Ok(Topic::Post),
            topics::FOLLOW => Ok(Topic::Follow),
            topics::UNFOLLOW => Ok(Topic::Unfollow),
            other => Err(DecodeError::UnknownTopic(other.to_string())),
        }
    }
}

/// like / post 的消息负载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostActivity {
    pub user_id: i64,
    pub post_id: i64,
}

/// follow / unfollow 的消息负载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowActivity {
    pub follower_id: i64,
    pub following_id: i64,
}

/// 解码后的活动事件
///
/// actor 是触发动作的用户；like/post 携带帖子 ID，follow/unfollow 携带被关注者 ID。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityEvent {
    Like { actor_id: i64, post_id: i64 },
    Post { actor_id: i64, post_id: i64 },
    Follow { actor_id: i64, target_id: i64 },
    Unfollow { actor_id: i64, target_id: i64 },
}

impl ActivityEvent {
    /// 按 topic 解码消息负载
    pub fn decode(topic: Topic, payload: &[u8]) -> Result<Self, DecodeError> {
        let malformed = |source| DecodeError::Malformed { topic, source };

        let event = match topic {
            Topic::Like | Topic::Post => {
                let p: PostActivity = serde_json::from_slice(payload).map_err(malformed)?;
                if topic == Topic::Like {
                    ActivityEvent::Like {
                        actor_id: p.user_id,
                        post_id: p.post_id,
                    }
                } else {
                    ActivityEvent::Post {
                        actor_id: p.user_id,
                        post_id: p.post_id,
                    }
                }
            }
            Topic::Follow | Topic::Unfollow => {
                let f: FollowActivity = serde_json::from_slice(payload).map_err(malformed)?;
                if topic == Topic::Follow {
                    ActivityEvent::Follow {
                        actor_id: f.follower_id,
                        target_id: f.following_id,
                    }
                } else {
                    ActivityEvent::Unfollow {
                        actor_id: f.follower_id,
                        target_id: f.following_id,
                    }
                }
            }
        };

        Ok(event)
    }

    pub fn topic(&self) -> Topic {
        match self {
            ActivityEvent::Like { .. } => Topic::Like,
            ActivityEvent::Post { .. } => Topic::Post,
            ActivityEvent::Follow { .. } => Topic::Follow,
            ActivityEvent::Unfollow { .. } => Topic::Unfollow,
        }
    }

    pub fn actor_id(&self) -> i64 {
        match *self {
            ActivityEvent::Like { actor_id, .. }
            | ActivityEvent::Post { actor_id, .. }
            | ActivityEvent::Follow { actor_id, .. }
            | ActivityEvent::Unfollow { actor_id, .. } => actor_id,
        }
    }
}
