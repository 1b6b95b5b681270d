//! Option flag families carried in the packet `option_flag` field.
//!
//! The meaning of `option_flag` depends on the packet type: Service packets
//! carry a [`DtmServiceFlag`], Message packets a [`MessageFlag`], Transfer
//! packets a [`TransferFlag`] and Exchange packets an
//! [`ExchangeState`](crate::exchange::ExchangeState).

use crate::error::PacketError;

macro_rules! option_flag {
    (
        $(#[$meta:meta])*
        $name:ident, $family:literal {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i64)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl $name {
            /// Raw wire value
            #[must_use]
            pub fn value(self) -> i64 {
                self as i64
            }
        }

        impl TryFrom<i64> for $name {
            type Error = PacketError;

            fn try_from(value: i64) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    _ => Err(PacketError::InvalidFlag {
                        field: $family,
                        value,
                    }),
                }
            }
        }
    };
}

option_flag! {
    /// Session control codes. The packet's `sequence` carries the argument.
    DtmServiceFlag, "service" {
        /// Liveness signal, no reply expected
        KeepAlive = 1,
        /// Echo request; argument is a token
        Echo = 2,
        /// Echo reply; argument is the request token
        EchoReply = 3,
        /// Request retransmission of the packet at `sequence`
        Resend = 4,
        /// Notify the peer that a packet arrived out of order
        OutOfSequence = 5,
        /// Notify the peer that data was lost; argument is a `DtmErrorFlag` code
        DataLost = 6,
        /// Restart the Primary channel; argument is the attempt number
        Resync = 7,
        /// Refuse the connection; argument is a `DtmErrorFlag` code
        Refusal = 8,
        /// Tear down the session
        Terminate = 9,
    }
}

option_flag! {
    /// Message packet options.
    MessageFlag, "message" {
        /// Application data
        Transmission = 1,
        /// Forward-secrecy key offer
        KeyRequest = 2,
        /// Key offer accepted
        KeyResponse = 3,
        /// Key offer refused
        KeyRefused = 4,
        /// Last packet under the previous key
        KeySynchronized = 5,
    }
}

option_flag! {
    /// File transfer packet options.
    TransferFlag, "transfer" {
        /// Offer a file (name and size)
        Request = 1,
        /// Offer accepted
        Accepted = 2,
        /// Offer refused
        Refused = 3,
        /// File content chunk
        DataChunk = 4,
        /// Sender finished
        Sent = 5,
        /// Receiver stored the file
        Received = 6,
        /// Receiver failed to store the file
        Failed = 7,
    }
}
