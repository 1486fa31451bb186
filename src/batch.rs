use crate::distributed::Collective;
use crate::error::{Error, Result};
use crate::stream::EngineStream;
use candle_core::{Device, Tensor, WithDType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Rank-independent description of one iteration's batch. This is what the
/// coordinating rank broadcasts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    /// Every row's input tokens, back to back.
    pub token_ids: Vec<u32>,
    pub input_lengths: Vec<usize>,
    pub sequence_lengths: Vec<usize>,
    pub prefix_lengths: Vec<usize>,
    pub is_context: Vec<bool>,
    pub block_tables: Vec<Vec<u32>>,
}

impl BatchDescriptor {
    pub fn from_streams<S: EngineStream>(streams: &[Arc<S>]) -> Self {
        let mut descriptor = BatchDescriptor::default();
        for row in streams.iter().flat_map(|stream| stream.model_input()) {
            descriptor.input_lengths.push(row.tokens.len());
            descriptor.token_ids.extend(row.tokens);
            descriptor.sequence_lengths.push(row.sequence_length);
            descriptor.prefix_lengths.push(row.reuse_length);
            descriptor.is_context.push(row.is_context);
            descriptor.block_tables.push(row.blocks);
        }
        descriptor
    }

    pub fn rows(&self) -> usize {
        self.input_lengths.len()
    }

    fn validate(&self) -> Result<()> {
        let rows = self.rows();
        if self.sequence_lengths.len() != rows
            || self.prefix_lengths.len() != rows
            || self.is_context.len() != rows
            || self.block_tables.len() != rows
        {
            return Err(Error::Serialization(format!(
                "batch descriptor has inconsistent row counts for {rows} rows"
            )));
        }
        let total: usize = self.input_lengths.iter().sum();
        if total != self.token_ids.len() {
            return Err(Error::Serialization(format!(
                "batch descriptor lists {} tokens but its rows sum to {}",
                self.token_ids.len(),
                total
            )));
        }
        Ok(())
    }
}

fn make_tensor_with_pad<D: WithDType>(
    x: &[Vec<D>],
    max_len: usize,
    pad: D,
    device: &Device,
) -> Result<Tensor> {
    let mut flattened = Vec::with_capacity(x.len() * max_len);
    for x_i in x {
        flattened.extend_from_slice(x_i);
        flattened.extend(std::iter::repeat(pad).take(max_len - x_i.len()));
    }
    Ok(Tensor::from_vec(flattened, (x.len(), max_len), device)?)
}

fn lengths_tensor(lengths: &[usize], device: &Device) -> Result<Tensor> {
    let lengths = lengths.iter().map(|len| *len as u32).collect::<Vec<_>>();
    let n = lengths.len();
    Ok(Tensor::from_vec(lengths, n, device)?)
}

/// One iteration's batch, rebuilt from scratch every step.
#[derive(Debug, Clone)]
pub struct BatchedInput {
    descriptor: BatchDescriptor,
    offsets: Vec<usize>,
    /// `[total_tokens]`
    pub input_ids: Tensor,
    /// `[total_tokens]`, absolute position of each input token.
    pub positions: Tensor,
    /// `[rows]`
    pub input_lengths: Tensor,
    /// `[rows]`
    pub sequence_lengths: Tensor,
    /// `[rows]`
    pub prefix_lengths: Tensor,
    /// `[rows, max_blocks]`, zero padded.
    pub block_tables: Tensor,
}

impl BatchedInput {
    pub fn from_descriptor(descriptor: BatchDescriptor, device: &Device) -> Result<Self> {
        descriptor.validate()?;
        let mut offsets = Vec::with_capacity(descriptor.rows() + 1);
        let mut positions = Vec::with_capacity(descriptor.token_ids.len());
        let mut offset = 0;
        for (input_len, seq_len) in descriptor
            .input_lengths
            .iter()
            .zip(descriptor.sequence_lengths.iter())
        {
            offsets.push(offset);
            offset += input_len;
            let start = seq_len.saturating_sub(*input_len) as u32;
            positions.extend(start..start + *input_len as u32);
        }
        offsets.push(offset);

        let total = descriptor.token_ids.len();
        let input_ids = Tensor::from_vec(descriptor.token_ids.clone(), total, device)?;
        let positions = Tensor::from_vec(positions, total, device)?;
        let max_blocks = descriptor
            .block_tables
            .iter()
            .map(|table| table.len())
            .max()
            .unwrap_or(0);
        let block_tables = make_tensor_with_pad(&descriptor.block_tables, max_blocks, 0, device)?;

        Ok(Self {
            input_lengths: lengths_tensor(&descriptor.input_lengths, device)?,
            sequence_lengths: lengths_tensor(&descriptor.sequence_lengths, device)?,
            prefix_lengths: lengths_tensor(&descriptor.prefix_lengths, device)?,
            input_ids,
            positions,
            block_tables,
            offsets,
            descriptor,
        })
    }

    /// Builds this iteration's batch on the coordinating rank and shares it
    /// with the rest of the group; other ranks receive it instead.
    ///
    /// `Ok(None)` on a non-coordinating rank means the coordinator sent
    /// nothing within `wait`.
    pub fn generate_model_input<S: EngineStream>(
        streams: &[Arc<S>],
        collective: &dyn Collective,
        wait: Duration,
        device: &Device,
    ) -> Result<Option<Self>> {
        let descriptor = if collective.is_coordinator() {
            let descriptor = BatchDescriptor::from_streams(streams);
            if collective.world_size() > 1 {
                let payload = bincode::serialize(&descriptor)?;
                collective.broadcast(Some(payload), wait)?;
            }
            descriptor
        } else {
            match collective.broadcast(None, wait)? {
                Some(payload) => bincode::deserialize(&payload)?,
                None => return Ok(None),
            }
        };
        Self::from_descriptor(descriptor, device).map(Some)
    }

    pub fn descriptor(&self) -> &BatchDescriptor {
        &self.descriptor
    }

    /// Number of rows, i.e. the number of outputs the executor must return.
    pub fn batch_size(&self) -> usize {
        self.descriptor.rows()
    }

    pub fn total_tokens(&self) -> usize {
        self.descriptor.token_ids.len()
    }

    pub fn row_tokens(&self, row: usize) -> &[u32] {
        &self.descriptor.token_ids[self.offsets[row]..self.offsets[row + 1]]
    }

    pub fn is_context(&self, row: usize) -> bool {
        self.descriptor.is_context[row]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{ChannelCollective, LocalCollective};
    use crate::metrics::RecordingReporter;
    use crate::stream::{GenerateConfig, GenerateInput, GenerateStream, StreamUpdate};

    fn stream(prompt: Vec<u32>, num_beams: usize) -> Arc<GenerateStream> {
        let config = GenerateConfig {
            num_beams,
            ..Default::default()
        };
        Arc::new(
            GenerateStream::new(
                GenerateInput::new(prompt, config),
                64,
                Arc::new(RecordingReporter::new()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_batch_size_counts_beams() {
        let streams = vec![stream(vec![1, 2, 3], 2), stream(vec![4], 1)];
        streams[0].set_kvcache(vec![vec![5], vec![6]], 0).unwrap();
        let batch = BatchedInput::generate_model_input(
            &streams,
            &LocalCollective,
            Duration::from_millis(1),
            &Device::Cpu,
        )
        .unwrap()
        .unwrap();
        assert_eq!(batch.batch_size(), 3);
        assert_eq!(batch.total_tokens(), 7);
        assert_eq!(batch.row_tokens(1), &[1, 2, 3]);
        assert_eq!(batch.row_tokens(2), &[4]);
        assert_eq!(batch.block_tables.dims(), &[3, 1]);
        assert_eq!(
            batch.block_tables.flatten_all().unwrap().to_vec1::<u32>().unwrap(),
            vec![5, 6, 0]
        );
    }

    #[test]
    fn test_decode_rows_feed_last_token_at_its_position() {
        let s = stream(vec![1, 2, 3], 1);
        s.update(StreamUpdate {
            new_tokens: vec![vec![9]],
            ..Default::default()
        })
        .unwrap();
        let batch = BatchedInput::from_descriptor(
            BatchDescriptor::from_streams(&[s]),
            &Device::Cpu,
        )
        .unwrap();
        assert!(!batch.is_context(0));
        assert_eq!(batch.input_ids.to_vec1::<u32>().unwrap(), vec![9]);
        assert_eq!(batch.positions.to_vec1::<u32>().unwrap(), vec![3]);
        assert_eq!(batch.sequence_lengths.to_vec1::<u32>().unwrap(), vec![4]);
    }

    #[test]
    fn test_inconsistent_descriptor_is_rejected() {
        let descriptor = BatchDescriptor {
            token_ids: vec![1, 2],
            input_lengths: vec![1],
            sequence_lengths: vec![1],
            prefix_lengths: vec![0],
            is_context: vec![true],
            block_tables: vec![vec![]],
        };
        assert!(BatchedInput::from_descriptor(descriptor, &Device::Cpu).is_err());
    }

    #[test]
    fn test_descriptor_reaches_other_rank() {
        let mut group = ChannelCollective::group(2);
        let peer = group.pop().unwrap();
        let root = group.pop().unwrap();
        let streams = vec![stream(vec![1, 2], 2)];
        let sent = BatchedInput::generate_model_input(
            &streams,
            &root,
            Duration::from_millis(1),
            &Device::Cpu,
        )
        .unwrap()
        .unwrap();
        let received = BatchedInput::generate_model_input::<GenerateStream>(
            &[],
            &peer,
            Duration::from_millis(100),
            &Device::Cpu,
        )
        .unwrap()
        .unwrap();
        assert_eq!(received.batch_size(), sent.batch_size());
        assert_eq!(received.descriptor(), sent.descriptor());
    }
}
