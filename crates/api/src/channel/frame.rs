use std::convert::Infallible;

use axum::extract::ws::{CloseFrame, Message};
use tokio_tungstenite::tungstenite::error::{CapacityError, Error as WsError};

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// 传输层帧, 会话循环只依赖这一层抽象
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseReason>),
}

impl Frame {
    /// 应用消息的字节长度; 控制帧返回None
    pub fn payload_len(&self) -> Option<usize> {
        match self {
            Frame::Text(text) => Some(text.len()),
            Frame::Binary(data) => Some(data.len()),
            _ => None,
        }
    }
}

/// 读取帧时的传输层错误
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// 消息超过传输层上限, 连接仍可发送关闭帧
    #[error("消息大小 {size} 超过传输层上限 {max_size}")]
    TooLarge { size: usize, max_size: usize },

    #[error("{0}")]
    Other(String),
}

impl From<axum::Error> for TransportError {
    fn from(err: axum::Error) -> Self {
        let inner = err.into_inner();
        match inner.downcast_ref::<WsError>() {
            Some(WsError::Capacity(CapacityError::MessageTooLong { size, max_size })) => {
                TransportError::TooLarge {
                    size: *size,
                    max_size: *max_size,
                }
            }
            _ => TransportError::Other(inner.to_string()),
        }
    }
}

impl From<Infallible> for TransportError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(data) => Frame::Binary(data.to_vec()),
            Message::Ping(data) => Frame::Ping(data.to_vec()),
            Message::Pong(data) => Frame::Pong(data.to_vec()),
            Message::Close(frame) => Frame::Close(
                frame.map(|f| CloseReason::new(f.code, f.reason.as_str().to_owned())),
            ),
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
            Frame::Ping(data) => Message::Ping(data.into()),
            Frame::Pong(data) => Message::Pong(data.into()),
            Frame::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
                code: r.code,
                reason: r.reason.into(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_frame_conversion() {
        let message: Message = Frame::Close(Some(CloseReason::new(4009, "superseded"))).into();
        assert_eq!(
            Frame::from(message),
            Frame::Close(Some(CloseReason::new(4009, "superseded")))
        );
    }

    #[test]
    fn test_capacity_error_is_recognized() {
        let err = axum::Error::new(WsError::Capacity(CapacityError::MessageTooLong {
            size: 4096,
            max_size: 2048,
        }));
        assert!(matches!(
            TransportError::from(err),
            TransportError::TooLarge {
                size: 4096,
                max_size: 2048
            }
        ));

        let err = axum::Error::new(WsError::ConnectionClosed);
        assert!(matches!(TransportError::from(err), TransportError::Other(_)));
    }

    #[test]
    fn test_payload_len_ignores_control_frames() {
        assert_eq!(Frame::Text("héllo".to_string()).payload_len(), Some(6));
        assert_eq!(Frame::Binary(vec![0; 3]).payload_len(), Some(3));
        assert_eq!(Frame::Ping(vec![1]).payload_len(), None);
    }
}
