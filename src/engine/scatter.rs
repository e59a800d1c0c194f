//! Scatter shard construction and gather shaping.
//!
//! A scattered step fans out into one shard per element (single dimension),
//! per index tuple (`dotproduct`), or per element of the Cartesian product
//! (`flat_crossproduct`, `nested_crossproduct`). Shards share the
//! non-scattered inputs and each receive one slice of the scattered ones.
//! The gather reassembles outputs in shard-creation order, restoring the
//! multi-dimensional shape for `nested_crossproduct`.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::workflow::{Parameters, ScatterMethod};

/// Build the per-shard parameter sets. Returns the shards in creation order
/// together with the scatter dimensions (one length per scattered input).
pub(crate) fn build_shard_parameters(
    base: &Parameters,
    scatter_ids: &[String],
    method: Option<ScatterMethod>,
) -> Result<(Vec<Parameters>, Vec<usize>)> {
    let mut arrays: Vec<(&str, &Vec<Value>)> = Vec::with_capacity(scatter_ids.len());
    for id in scatter_ids {
        let values = base
            .get(id)
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Execution(format!("scatter input {id} is not an array")))?;
        arrays.push((id, values));
    }

    // inputs every shard shares
    let shared: Parameters = base
        .iter()
        .filter(|(k, _)| !scatter_ids.contains(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let dims: Vec<usize> = arrays.iter().map(|(_, values)| values.len()).collect();

    let index_tuples: Vec<Vec<usize>> = match (arrays.len(), method) {
        (0, _) => return Err(Error::Execution("scatter declared with no inputs".into())),
        (1, _) => (0..dims[0]).map(|i| vec![i]).collect(),
        (_, Some(ScatterMethod::Dotproduct)) => {
            if dims.windows(2).any(|w| w[0] != w[1]) {
                return Err(Error::Execution(format!(
                    "dotproduct scatter requires equal-length arrays, got {dims:?}"
                )));
            }
            (0..dims[0]).map(|i| vec![i; arrays.len()]).collect()
        }
        (_, Some(ScatterMethod::FlatCrossproduct))
        | (_, Some(ScatterMethod::NestedCrossproduct)) => cartesian_indices(&dims),
        (_, None) => {
            return Err(Error::Execution(
                "scatter over multiple inputs requires a scatterMethod".into(),
            ))
        }
    };

    let shards = index_tuples
        .into_iter()
        .map(|tuple| {
            let mut params = shared.clone();
            for (position, (id, values)) in arrays.iter().enumerate() {
                params.insert(id.to_string(), values[tuple[position]].clone());
            }
            params
        })
        .collect();

    Ok((shards, dims))
}

/// Row-major Cartesian product of index ranges: the last dimension varies
/// fastest, which is the order [`reshape`] depends on.
fn cartesian_indices(dims: &[usize]) -> Vec<Vec<usize>> {
    let total: usize = dims.iter().product();
    let mut tuples = Vec::with_capacity(total);
    for mut flat in 0..total {
        let mut tuple = vec![0; dims.len()];
        for (position, dim) in dims.iter().enumerate().rev() {
            tuple[position] = flat % dim;
            flat /= dim;
        }
        tuples.push(tuple);
    }
    tuples
}

/// Reassemble a flat, shard-ordered value list into the nested shape of the
/// scatter dimensions.
pub(crate) fn reshape(values: Vec<Value>, dims: &[usize]) -> Value {
    if dims.len() <= 1 {
        return Value::Array(values);
    }
    let inner: usize = dims[1..].iter().product();
    Value::Array(
        values
            .chunks(inner.max(1))
            .map(|chunk| reshape(chunk.to_vec(), &dims[1..]))
            .collect(),
    )
}
