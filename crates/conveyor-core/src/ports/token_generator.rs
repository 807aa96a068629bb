//! TokenGenerator port - トークン / 実行 ID 生成の抽象化
//!
//! # 実装
//! - **RandomTokenGenerator**: access token は UUID v4、
//!   process token / execution id は ULID

use crate::ports::Clock;
use ulid::Ulid;
use uuid::Uuid;

/// TokenGenerator は enqueue / process ごとの識別子を生成
///
/// # 用途
/// - access token: remote status push の認証（推測不能であること）
/// - process token: enqueue ごとに再生成
/// - execution id: 実行開始ごとに採番（時刻でソート可能）
pub trait TokenGenerator: Send + Sync {
    fn access_token(&self) -> String;

    fn process_token(&self) -> String;

    fn execution_id(&self) -> String;
}

/// RandomTokenGenerator は Clock を使って ULID の時刻部分を決める
///
/// FixedClock を渡せば timestamp 部分が決定的になります。
pub struct RandomTokenGenerator<C> {
    clock: C,
}

impl<C: Clock> RandomTokenGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> TokenGenerator for RandomTokenGenerator<C> {
    fn access_token(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn process_token(&self) -> String {
        self.ulid().to_string()
    }

    fn execution_id(&self) -> String {
        self.ulid().to_string()
    }
}
