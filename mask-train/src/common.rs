//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use bbox::{prelude::*, CyCxHW, GridSpan, TLBR};
pub use chrono::{DateTime, Local};
pub use derivative::Derivative;
pub use futures::{
    future::FutureExt,
    stream::{self, StreamExt, TryStreamExt},
};
pub use itertools::{izip, Itertools};
pub use noisy_float::prelude::*;
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use serde::{Deserialize, Deserializer, Serialize, Serializer};
pub use std::{
    borrow::{Borrow, Cow},
    collections::{BTreeMap, HashMap, HashSet},
    fmt::Debug,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, ModuleT as _, OptimizerConfig as _},
    Device, IndexOp, Kind, Tensor,
};
pub use tfrecord::{EventWriter, EventWriterInit};
pub use tokio::sync::broadcast;
pub use tracing::{debug, error, info, info_span, trace, warn};

pub type Fallible<T> = Result<T, Error>;
