use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
};
use futures::{future, SinkExt, StreamExt};

use crate::{
    channel::{run_session, Frame},
    routes::AppState,
};

/// 升级为Agent控制通道
///
/// 传输层上限放宽到两倍。超过配置上限的消息由会话检查, 超过传输层上限的
/// 由读取错误识别, 两种情况都按1009关闭。
pub async fn channel_upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let ctx = state.channel.clone();
    let shutdown = state.shutdown.clone();
    let transport_limit = ctx.config.max_message_bytes.saturating_mul(2);

    ws.max_message_size(transport_limit)
        .max_frame_size(transport_limit)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            let outgoing =
                sink.with(|frame: Frame| future::ready(Ok::<Message, axum::Error>(frame.into())));
            let incoming = stream.map(|message| message.map(Frame::from));
            run_session(ctx, incoming, outgoing, Some(peer.to_string()), shutdown).await;
        })
}
