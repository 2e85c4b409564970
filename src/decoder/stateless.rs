// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateless decoders.
//!
//! Stateless here refers to the backend API targeted by these decoders. The decoders themselves do
//! hold the decoding state so the backend doesn't need to.
//!
//! The [`StatelessDecoder`] struct is the basis of all stateless decoders. It is created by
//! combining a codec to a backend, after which NAL units can be submitted through the
//! [`StatelessVideoDecoder::decode`] method.

pub mod mvd;

use thiserror::Error;

use crate::codec::mvd::camera::CameraParameterError;
use crate::codec::mvd::dpb::DpbError;
use crate::codec::mvd::parser::LayerId;
use crate::codec::mvd::parser::Nalu;
use crate::codec::mvd::parser::ParameterSetError;
use crate::codec::mvd::refs::ReferenceError;
use crate::decoder::DecoderConfig;
use crate::decoder::DecoderEvent;
use crate::decoder::EventQueue;

/// Error returned by stateless backend methods.
#[derive(Error, Debug)]
pub enum StatelessBackendError {
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by stateless backend methods.
pub type StatelessBackendResult<T> = Result<T, StatelessBackendError>;

/// Decoder implementations can use this enum to represent their decoding state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum DecodingState {
    /// Decoder will only accept parameter sets and SEI until a layer can decode.
    #[default]
    AwaitingParameterSets,
    /// Decoder is currently decoding input.
    Decoding,
    /// The end of the stream has been reached.
    Ended,
    /// A fatal error occurred. Only a teardown gets the decoder going again.
    Aborted,
}

/// Where a decoder stands in the stream, as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    WaitingForParameterSets,
    ReadyForPicture,
    /// A picture of `layer` is being assembled and has received `slice_idx` slices so far.
    InPicture { layer: LayerId, slice_idx: usize },
    SessionEnd,
    Aborted,
}

/// Error returned by the [`StatelessVideoDecoder::decode`] method.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error(transparent)]
    ParameterSet(#[from] ParameterSetError),
    #[error(transparent)]
    CameraParameters(#[from] CameraParameterError),
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error(transparent)]
    Dpb(#[from] DpbError),
    #[error("slice of POC {poc} was replayed twice in a row")]
    ReplayLoop { poc: i32 },
    #[error("the session has been aborted by a previous error")]
    SessionAborted,
    #[error(transparent)]
    DecoderError(#[from] anyhow::Error),
    #[error(transparent)]
    BackendError(#[from] StatelessBackendError),
}

impl DecodeError {
    /// Whether the session cannot go on after this error.
    ///
    /// Reference errors only invalidate the current picture. The decoder escalates them
    /// according to its [`FailurePolicy`](crate::decoder::FailurePolicy).
    pub fn is_session_fatal(&self) -> bool {
        match self {
            DecodeError::CameraParameters(e) => !e.is_recoverable(),
            DecodeError::Reference(_) | DecodeError::Dpb(_) => false,
            _ => true,
        }
    }
}

/// Specifies the type of picture that a backend will create for a given codec.
///
/// The picture type is state that is preserved from the start of a given frame to the end of its
/// access unit. Some backends don't need it, in this case they can just set `Picture` to `()`.
pub trait StatelessDecoderBackendPicture<Codec: StatelessCodec> {
    /// Backend-specific type representing a frame being decoded. Useful for decoders that need
    /// to render a frame in several steps and to preserve its state in between.
    ///
    /// Backends that don't use this can simply set it to `()`.
    type Picture;
}

/// Stateless video decoder interface.
///
/// NAL units are submitted one at a time. Each unit is fully processed, including the backend
/// calls it triggers, before [`decode`](StatelessVideoDecoder::decode) returns.
pub trait StatelessVideoDecoder {
    /// Processes `nalu`.
    ///
    /// After an error for which [`DecodeError::is_session_fatal`] holds, every call returns
    /// [`DecodeError::SessionAborted`] until [`teardown`](StatelessVideoDecoder::teardown).
    fn decode(&mut self, nalu: Nalu) -> Result<(), DecodeError>;

    /// Flush the decoder i.e. finish the pending picture and access unit and make sure every
    /// decoded picture is ready to be retrieved via [`next_event`].
    ///
    /// [`next_event`]: StatelessVideoDecoder::next_event
    fn flush(&mut self) -> Result<(), DecodeError>;

    /// Returns the next event, if there is any pending.
    fn next_event(&mut self) -> Option<DecoderEvent>;

    fn session_state(&self) -> SessionState;

    /// Drops all the decoding state, including parameter sets and pending events. The decoder
    /// can be reused afterwards. Calling this several times is harmless.
    fn teardown(&mut self);
}

pub trait StatelessCodec {
    /// Type providing current format information for the codec.
    type FormatInfo;
    /// State that needs to be kept during a decoding operation, typed by backend.
    type DecoderState<B: StatelessDecoderBackendPicture<Self>>;
}

/// A struct that serves as a basis to implement a stateless decoder.
///
/// A stateless decoder is defined by two generic parameters:
///
/// * A codec, represented by a type that implements [`StatelessCodec`]. This type defines the
/// codec-specific decoder state and other codec properties.
/// * A backend, i.e. an interface to the pixel reconstruction of the pictures.
///
/// This struct just manages the high-level decoder state as well as the queue of events.
/// All the rest is left to codec-specific code.
pub struct StatelessDecoder<C, B>
where
    C: StatelessCodec,
    B: StatelessDecoderBackendPicture<C>,
{
    config: DecoderConfig,

    events: EventQueue,

    decoding_state: DecodingState,

    /// The backend doing the pixel reconstruction.
    backend: B,

    /// Codec-specific state.
    codec: C::DecoderState<B>,
}

impl<C, B> StatelessDecoder<C, B>
where
    C: StatelessCodec,
    B: StatelessDecoderBackendPicture<C>,
{
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn push_event(&mut self, event: DecoderEvent) {
        self.events.push(event);
    }
}
