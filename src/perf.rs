//! Bulk image work: parallel parsing and serialization.
//!
//! # Parallel parsing
//!
//! [`load_images_parallel`] reads and decodes many images concurrently with
//! Rayon.  Each image is read into memory under its stream lock and decoded
//! outside it, so workers only serialize on the raw read.  The decoded
//! properties are grafted into the tree afterwards on the calling thread,
//! since the arena itself is not shared.
//!
//! Without the `parallel` feature both functions run sequentially with the
//! same results.

use crate::io_stream::DecodeError;
use crate::tree::write::image_bytes;
use crate::tree::{ImageJob, NodeId, ParsedProperty, PropertyTree, TreeError};

type Parsed = (NodeId, Result<Vec<ParsedProperty>, DecodeError>);

fn run_jobs(jobs: &[(NodeId, ImageJob)]) -> Vec<Parsed> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        jobs.par_iter().map(|(id, job)| (*id, job.run())).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        jobs.iter().map(|(id, job)| (*id, job.run())).collect()
    }
}

/// Parse every unparsed image in `images`.
///
/// Images that decode successfully are grafted even when another one fails;
/// the first failure is then returned.  Returns the number of images parsed.
pub fn load_images_parallel(tree: &mut PropertyTree, images: &[NodeId]) -> Result<usize, TreeError> {
    let mut jobs = Vec::with_capacity(images.len());
    for &id in images {
        if let Some(job) = tree.image_job(id)? {
            jobs.push((id, job));
        }
    }
    tracing::debug!(images = jobs.len(), "parsing images");

    let mut first_err = None;
    let mut parsed = 0;
    for (id, result) in run_jobs(&jobs) {
        match result {
            Ok(props) => {
                tree.graft_parsed(id, props)?;
                parsed += 1;
            }
            Err(e) => {
                tracing::error!(image = %tree.full_path(id), error = %e, "image failed to parse");
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e.into()),
        None => Ok(parsed),
    }
}

/// Bytes to store for each of `images`, in the same order.
pub fn serialize_images_parallel(tree: &PropertyTree, images: &[NodeId]) -> Result<Vec<Vec<u8>>, TreeError> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        images.par_iter().map(|&id| image_bytes(tree, id)).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        images.iter().map(|&id| image_bytes(tree, id)).collect()
    }
}
