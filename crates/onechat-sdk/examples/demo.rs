//! OneChat 演示
//!
//! 使用内存后端：登录、发送文本和图片、打印消息列表

use anyhow::Context;
use bytes::Bytes;
use onechat_sdk::{
    AuthUser, ChatEvent, Composer, MemoryBlobStore, MemoryIdentityProvider, MemoryOrderedStore,
    OneChatConfig, OneChatSDK, RenderedContent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n🚀 OneChat 演示\n");

    let config = OneChatConfig::builder()
        .data_dir("/tmp/onechat_demo")
        .storage_bucket("onechat-demo.appspot.com")
        .build();

    let identity = Arc::new(
        MemoryIdentityProvider::new()
            .with_account(AuthUser::new("u1", "Ann").with_photo_url("https://example.com/ann.png")),
    );
    let sdk = OneChatSDK::new(
        config,
        identity,
        Arc::new(MemoryOrderedStore::new()),
        Arc::new(MemoryBlobStore::new("onechat-demo.appspot.com")),
    )
    .context("创建 SDK 失败")?;

    sdk.events().add_listener("notice", |event| {
        if let ChatEvent::Notice { message, timeout_ms, .. } = event {
            println!("💡 提示 ({}ms): {}", timeout_ms, message);
        }
    });

    sdk.initialize().await?;

    // 未登录时发送会得到提示
    let mut composer = Composer::new();
    composer.set_input("hello?");
    if let Err(e) = sdk.submit(&mut composer).await {
        println!("未登录发送失败: {}", e);
    }

    sdk.sign_in().await?;
    sleep(Duration::from_millis(50)).await;
    println!("头部: {:?}", sdk.header());

    sdk.submit(&mut composer).await?;
    sdk.send_text("line one\nline two").await?;
    sdk.send_image(Bytes::from_static(b"\x89PNG"), "cat.png", "image/png")
        .await?;

    sleep(Duration::from_millis(100)).await;

    println!("\n【消息列表】");
    for message in sdk.view().snapshot() {
        match &message.content {
            RenderedContent::Text { lines } => {
                println!("{} ({}): {}", message.author_name, message.id, lines.join(" / "))
            }
            RenderedContent::Image { src, loading } => {
                println!("{} ({}): [image {}{}]", message.author_name, message.id, src, if *loading { " loading" } else { "" })
            }
        }
    }

    let stats = sdk.events().get_stats();
    println!("\n事件总数: {}", stats.total_events);

    sdk.shutdown().await?;
    Ok(())
}
