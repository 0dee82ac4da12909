use std::collections::BTreeMap;

use code_index_chunker::{file_hash, BlockType, Chunker, ChunkerConfig, ChunkingStrategy, ReadStrategy};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const MIB: usize = 1024 * 1024;

#[test]
fn tight_budget_falls_back_to_chunked_reads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("export.csv");
    let row = "2024-03-01,warehouse-12,sku-000481,restocked,00042\n";
    let content = row.repeat(500_000 / row.len());
    std::fs::write(&path, &content).unwrap();
    // a full read needs 3x the file, a chunked one 1.5x
    assert!(3 * content.len() > MIB && 3 * content.len() / 2 <= MIB);

    let config = ChunkerConfig {
        large_file_threshold_bytes: MIB as u64,
        streaming_threshold_bytes: 4 * MIB as u64,
        ..Default::default()
    };
    let chunker = Chunker::new(config);
    let reader = chunker.reader();
    assert_eq!(
        reader.choose_strategy(content.len() as u64, None),
        ReadStrategy::Standard
    );

    let mut reassembled = String::new();
    let mut indexes = Vec::new();
    let budget = reader.process_with_memory_budget(
        &path,
        |data, index, _| {
            indexes.push(index);
            reassembled.push_str(data);
        },
        1,
    );

    assert!(budget.outcome.success);
    assert_eq!(budget.strategy_used, ReadStrategy::Chunked);
    assert_eq!(budget.shortfall_bytes, None);
    assert_eq!(budget.budget_bytes, MIB as u64);
    assert_eq!(budget.estimated_memory_bytes, (content.len() as u64 * 3).div_ceil(2));
    assert_eq!(indexes, (0..indexes.len()).collect::<Vec<_>>());
    assert!(reassembled == content);

    let starved = reader.process_with_memory_budget(&path, |_, _, _| {}, 0);
    assert!(starved.outcome.success);
    assert_eq!(starved.strategy_used, ReadStrategy::Streaming);
    assert_eq!(starved.shortfall_bytes, Some(starved.estimated_memory_bytes));
}

#[cfg(unix)]
#[test]
fn chunker_reads_through_a_mapping_when_enabled() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.rs");
    let source = "pub fn balance(entries: &[i64]) -> i64 {\n    entries.iter().copied().sum::<i64>()\n}\n";
    std::fs::write(&path, source).unwrap();

    let config = ChunkerConfig {
        use_mapped_file_reading: true,
        mapped_min_file_size_bytes: 0,
        ..Default::default()
    };
    let chunker = Chunker::new(config);
    let blocks = chunker.chunk_file(&path);

    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].block_type, BlockType::Function);
    assert_eq!(blocks[0].identifier, "balance");
    assert_eq!(blocks[0].file_hash, file_hash(source));

    let metrics = chunker.read_metrics();
    assert_eq!(metrics.mapped_attempts, 1);
    assert_eq!(metrics.mapped_successes, 1);
    assert_eq!(metrics.buffered_reads, 0);
    assert_eq!(metrics.bytes_read, source.len() as u64);
}

#[test]
fn short_lines_at_segment_boundaries_stay_covered() {
    const SEGMENT: usize = 1200;
    const SEGMENTS: usize = 40;

    // every 1200 byte read ends with ten 115 byte lines and a short closing line
    let mut content = String::new();
    for segment in 0..SEGMENTS {
        for line in 0..10 {
            let text = format!("segment {segment:02} line {line:02} carries a steady payload for the collector");
            content.push_str(&format!("{text:<114}\n"));
        }
        content.push_str(&format!("{:<49}\n", "short closing line"));
        assert_eq!(content.len(), (segment + 1) * SEGMENT);
    }

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("boundaries.txt");
    std::fs::write(&path, &content).unwrap();
    let file_path = path.to_string_lossy().into_owned();

    let config = ChunkerConfig {
        default_chunk_size_bytes: SEGMENT as u64,
        max_chunk_size_bytes: SEGMENT as u64,
        large_file_threshold_bytes: 1024,
        streaming_threshold_bytes: 2048,
        language_chunk_sizes: BTreeMap::new(),
        ..Default::default()
    };
    let chunker = Chunker::new(config.clone());
    assert_eq!(
        chunker
            .reader()
            .choose_strategy(content.len() as u64, Some("text")),
        ReadStrategy::Streaming
    );
    assert_eq!(
        chunker
            .reader()
            .optimal_chunk_size(content.len() as u64, Some("text")),
        SEGMENT as u64
    );

    let streamed = chunker.chunk_file(&path);

    let mut next_start = 1;
    for block in &streamed {
        assert_eq!(block.start_line, next_start);
        next_start = block.end_line + 1;
    }
    assert_eq!(next_start, SEGMENTS * 11 + 1);
    let closing_lines: usize = streamed
        .iter()
        .map(|b| b.content.matches("short closing line").count())
        .sum();
    assert_eq!(closing_lines, SEGMENTS);

    let in_memory = Chunker::new(ChunkerConfig {
        chunking_strategy: ChunkingStrategy::Lines,
        ..config
    })
    .chunk(&content, &file_path, &file_hash(&content));
    assert_eq!(streamed, in_memory);
}
