//! Environmental management
//!
//! [`initialize`] binds a [`Transport`] to a fresh request engine and returns the [`Universe`],
//! which gives access to the world communicator, the buffered-send region and finalization.
//! Nothing is global: every `Universe` owns its own engine, so several of them can live in one
//! process, e.g. the ranks of a [`Loopback`](crate::transport::loopback::Loopback) world.
//!
//! # Standard section(s)
//!
//! 8.7

use std::env;

use conv::ConvUtil;
use log::debug;

use crate::datatype::Datatype;
use crate::engine::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::topology::SimpleCommunicator;
use crate::transport::Transport;
use crate::{Count, Tag};

pub use crate::bsend::BSEND_OVERHEAD;

/// Default largest tag value accepted by send operations
pub const TAG_UB: Tag = Tag::MAX;

/// Stages in the life of a request engine
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Lifecycle {
    /// Created but not yet ready to issue operations
    Uninitialized,
    /// Operations can be issued
    Initialized,
    /// Finalized, every further operation fails with `AlreadyFinalized`
    Finalized,
}

/// Runtime configuration of a request engine
///
/// # Examples
///
/// ```
/// use mpi_p2p::Config;
///
/// let config = Config {
///     tag_ub: 1 << 15,
///     ..Config::default()
/// };
/// assert_eq!(config.bsend_overhead, mpi_p2p::environment::BSEND_OVERHEAD);
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// Largest tag accepted by send operations, receives also accept `ANY_TAG`
    pub tag_ub: Tag,
    /// Bookkeeping bytes charged against the buffered-send region per message
    pub bsend_overhead: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tag_ub: TAG_UB,
            bsend_overhead: BSEND_OVERHEAD,
        }
    }
}

impl Config {
    /// The default configuration overridden by `MPI_P2P_TAG_UB` and `MPI_P2P_BSEND_OVERHEAD`
    ///
    /// Fails with `InvalidArgument` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Config> {
        Config::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(value) = lookup("MPI_P2P_TAG_UB") {
            config.tag_ub = parse_var("MPI_P2P_TAG_UB", &value)?;
        }
        if let Some(value) = lookup("MPI_P2P_BSEND_OVERHEAD") {
            config.bsend_overhead = parse_var("MPI_P2P_BSEND_OVERHEAD", &value)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tag_ub < 0 {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                format!("tag upper bound {} is negative", self.tag_ub),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::with_detail(
            ErrorKind::InvalidArgument,
            format!("cannot parse {}={:?}", key, value),
        )
    })
}

/// Global context
///
/// Dropping the `Universe` finalizes its engine.
#[derive(Debug)]
pub struct Universe {
    context: Context,
    world: SimpleCommunicator,
}

impl Universe {
    /// The 'world communicator'
    ///
    /// Contains all processes reachable through the transport.
    pub fn world(&self) -> SimpleCommunicator {
        self.world.clone()
    }

    /// The request engine of this universe
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The configuration the engine was initialized with
    pub fn config(&self) -> Config {
        self.context.engine().config()
    }

    /// Where the engine is in its life
    pub fn lifecycle(&self) -> Lifecycle {
        self.context.lifecycle()
    }

    /// The size in bytes of the buffer used for buffered communication.
    pub fn buffer_size(&self) -> usize {
        self.context.engine().buffer_size()
    }

    /// Attach `buffer` for use by buffered-mode sends.
    ///
    /// Fails with `BufferAlreadyExists` if a buffer is attached already.
    ///
    /// # Standard section(s)
    ///
    /// 3.6
    pub fn attach_buffer(&mut self, buffer: Vec<u8>) -> Result<()> {
        self.context.engine().attach_buffer(buffer)
    }

    /// Set the size in bytes of the buffer used for buffered communication.
    ///
    /// Detaches the current buffer first; a size of `0` leaves no buffer attached. Fails with
    /// `InvalidSize` if `size` is negative.
    pub fn set_buffer_size(&mut self, size: Count) -> Result<()> {
        let size: usize = size.value_as().map_err(|_| {
            Error::with_detail(
                ErrorKind::InvalidSize,
                format!("buffer size must not be negative, got {}", size),
            )
        })?;
        self.detach_buffer()?;
        if size > 0 {
            self.attach_buffer(vec![0; size])?;
        }
        Ok(())
    }

    /// Detach the buffer used for buffered communication and hand it back.
    ///
    /// Waits for all buffered messages to leave the buffer first. Returns an empty `Vec` if no
    /// buffer is attached.
    ///
    /// # Standard section(s)
    ///
    /// 3.6
    pub fn detach_buffer(&mut self) -> Result<Vec<u8>> {
        self.context.engine().detach_buffer()
    }

    /// Release a handle to a datatype.
    ///
    /// The description itself is released once no handle and no datatype built from it remain.
    /// Predefined datatypes cannot be freed before the universe is finalized.
    ///
    /// # Standard section(s)
    ///
    /// 4.1.10
    pub fn free_datatype(&self, datatype: Datatype) -> Result<()> {
        self.context.engine().free_datatype(datatype)
    }

    /// Finalize the engine.
    ///
    /// Requests still in flight are cancelled where possible, buffered messages are drained and
    /// every later operation fails with `AlreadyFinalized`.
    ///
    /// # Standard section(s)
    ///
    /// 8.7
    pub fn finalize(&mut self) -> Result<()> {
        self.context.engine().finalize()
    }
}

impl Drop for Universe {
    fn drop(&mut self) {
        if self.context.lifecycle() == Lifecycle::Initialized {
            if let Err(err) = self.finalize() {
                debug!("finalize on drop failed: {}", err);
            }
        }
    }
}

/// Initialize a request engine on top of `transport` with the default configuration.
///
/// Equivalent to: `initialize_with_config(transport, Config::default())`
pub fn initialize<T>(transport: T) -> Result<Universe>
where
    T: Transport + 'static,
{
    initialize_with_config(transport, Config::default())
}

/// Initialize a request engine on top of `transport`.
///
/// Fails with `InvalidArgument` if the configuration is inconsistent.
pub fn initialize_with_config<T>(transport: T, config: Config) -> Result<Universe>
where
    T: Transport + 'static,
{
    config.validate()?;
    let rank = transport.world_rank();
    let size = transport.world_size();
    let context = Context::new(Box::new(transport), config);
    context.engine().initialize()?;
    debug!("initialized rank {} of {}", rank, size);
    let world = SimpleCommunicator::world(context.clone(), rank, size);
    Ok(Universe { context, world })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::Loopback;

    #[test]
    fn config_from_lookup() {
        let config = Config::from_lookup(|key| match key {
            "MPI_P2P_TAG_UB" => Some("32767".to_owned()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.tag_ub, 32767);
        assert_eq!(config.bsend_overhead, BSEND_OVERHEAD);

        let err = Config::from_lookup(|key| match key {
            "MPI_P2P_BSEND_OVERHEAD" => Some("lots".to_owned()),
            _ => None,
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = Config::from_lookup(|key| match key {
            "MPI_P2P_TAG_UB" => Some("-1".to_owned()),
            _ => None,
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn lifecycle_transitions() {
        let mut universe = initialize(Loopback::single()).unwrap();
        assert_eq!(universe.lifecycle(), Lifecycle::Initialized);
        universe.finalize().unwrap();
        assert_eq!(universe.lifecycle(), Lifecycle::Finalized);
        assert_eq!(
            universe.finalize().unwrap_err().kind(),
            ErrorKind::AlreadyFinalized
        );
    }

    #[test]
    fn set_buffer_size_replaces_buffer() {
        let mut universe = initialize(Loopback::single()).unwrap();
        universe.set_buffer_size(64).unwrap();
        assert_eq!(universe.buffer_size(), 64);
        universe.set_buffer_size(128).unwrap();
        assert_eq!(universe.buffer_size(), 128);
        universe.set_buffer_size(0).unwrap();
        assert_eq!(universe.buffer_size(), 0);
        assert_eq!(
            universe.set_buffer_size(-1).unwrap_err().kind(),
            ErrorKind::InvalidSize
        );
    }

    #[test]
    fn permanent_types_outlive_the_universe() {
        use crate::datatype::Equivalence;

        let mut universe = initialize(Loopback::single()).unwrap();
        assert_eq!(
            universe
                .free_datatype(i32::equivalent_datatype())
                .unwrap_err()
                .kind(),
            ErrorKind::CannotFreePermanent
        );
        let derived = Datatype::contiguous(2, &i32::equivalent_datatype()).unwrap();
        universe.free_datatype(derived).unwrap();
        universe.finalize().unwrap();
        universe.free_datatype(i32::equivalent_datatype()).unwrap();
    }
}
