//! Defines messages used to communicate with the network of nodes over TCP.
use crate::error::MlError;
use crate::network::{
    Connection, FramedSink, FramedStream, Message, MessageCodec,
};
use bincode::{deserialize, serialize};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

const MAX_FRAME_SIZE: usize = 1_073_741_824; // 1 GB

impl<T> Message<T> {
    /// Creates a new `Message`.
    pub fn new(
        msg_id: usize,
        sender_id: usize,
        target_id: usize,
        msg: T,
    ) -> Self {
        Message {
            msg_id,
            sender_id,
            target_id,
            msg,
        }
    }
}

impl<T> MessageCodec<T> {
    /// Creates a new `MessageCodec`
    pub(crate) fn new() -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_SIZE)
            .new_codec();
        MessageCodec {
            phantom: std::marker::PhantomData,
            codec,
        }
    }

    /// Reuses this codec, and any partially read frame state, for messages
    /// of a different type. Used once a connection's introduction is done.
    pub(crate) fn retype<U>(self) -> MessageCodec<U> {
        MessageCodec {
            phantom: std::marker::PhantomData,
            codec: self.codec,
        }
    }
}

impl<T: DeserializeOwned> Decoder for MessageCodec<T> {
    type Item = Message<T>;
    type Error = MlError;
    /// Decodes a message by reading the length of the message (at the start of
    /// a frame) and then reading that many bytes from a buffer to complete the
    /// frame.
    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        match self.codec.decode(src)? {
            Some(data) => Ok(Some(deserialize(&data)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<Message<T>> for MessageCodec<T> {
    type Error = MlError;
    /// Encodes a message by writing the length of the serialized message at
    /// the start of a frame, and then writing that many bytes into a buffer
    /// to be sent.
    fn encode(
        &mut self,
        item: Message<T>,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let serialized = serialize(&item)?;
        Ok(self.codec.encode(Bytes::from(serialized), dst)?)
    }
}

/// Reads the next message from the given `reader`
pub(crate) async fn read_msg<T: DeserializeOwned>(
    reader: &mut FramedStream<T>,
) -> Result<Message<T>, MlError> {
    match reader.next().await {
        None => Err(MlError::StreamClosed),
        Some(x) => Ok(x?),
    }
}

/// Send the given `message` to the node with `target_id` in `directory`
pub(crate) async fn send_msg<T: Serialize>(
    target_id: usize,
    message: Message<T>,
    directory: &mut HashMap<usize, Connection<T>>,
) -> Result<(), MlError> {
    match directory.get_mut(&target_id) {
        None => Err(MlError::UnknownId),
        Some(conn) => {
            conn.sink.send(message).await?;
            Ok(())
        }
    }
}

/// Closes a connection that duplicates one we already have.
pub(crate) fn existing_conn_err<T, U>(
    stream: FramedStream<T>,
    sink: FramedSink<U>,
) -> MlError {
    let reader = stream.into_inner();
    drop(reader.unsplit(sink.into_inner()));
    MlError::ReconnectionError
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::{Envelope, Op};

    #[test]
    fn test_codec_frames() {
        let mut codec = MessageCodec::<Envelope>::new();
        let mut buf = BytesMut::new();
        let env = Envelope {
            sender: 2,
            seq: 9,
            op: Op::Broadcast { root: 1 },
            payload: vec![1, 2, 3],
        };
        codec
            .encode(Message::new(4, 2, 0, env.clone()), &mut buf)
            .unwrap();
        // a partial frame decodes to nothing
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.msg_id, 4);
        assert_eq!(decoded.sender_id, 2);
        assert_eq!(decoded.msg, env);
    }
}
