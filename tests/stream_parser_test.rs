use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use rmq_bulk_loader::config::QueueConfig;
use rmq_bulk_loader::parser::RecordParser;
use rmq_bulk_loader::replay::ReplayConsumer;
use rmq_bulk_loader::stream::MessageStream;

/// Every way of cutting `text` into non-empty consecutive pieces.
fn splittings(text: &str) -> Vec<Vec<String>> {
    let chars: Vec<char> = text.chars().collect();
    let cuts = chars.len().saturating_sub(1);
    (0u32..(1 << cuts))
        .map(|mask| {
            let mut pieces = Vec::new();
            let mut current = String::new();
            for (i, c) in chars.iter().enumerate() {
                current.push(*c);
                if i < cuts && mask & (1 << i) != 0 {
                    pieces.push(std::mem::take(&mut current));
                }
            }
            pieces.push(current);
            pieces
        })
        .collect()
}

fn reference_rows(text: &str) -> Vec<Vec<String>> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes())
        .records()
        .map(|record| record.unwrap().iter().map(str::to_string).collect())
        .collect()
}

async fn load(messages: Vec<String>) -> Vec<(u64, Vec<String>)> {
    let consumer = ReplayConsumer::from_messages(messages);
    let stream = MessageStream::new(
        consumer,
        QueueConfig::for_queue("rows"),
        CancellationToken::new(),
        Handle::current(),
    );
    tokio::task::spawn_blocking(move || {
        RecordParser::new(stream)
            .map(|row| row.map(|row| (row.number(), row.fields)))
            .collect::<Result<Vec<_>, _>>()
    })
    .await
    .unwrap()
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn any_message_boundaries_parse_like_the_joined_text() {
    let text = "1,\"a,\nb\",c\n2,x";
    for messages in splittings(text) {
        // each delivery is followed by a line break
        let joined: String = messages.iter().map(|m| format!("{m}\n")).collect();
        let expected = reference_rows(&joined);

        let rows = load(messages.clone()).await;
        let numbers: Vec<u64> = rows.iter().map(|(n, _)| *n).collect();
        let fields: Vec<Vec<String>> = rows.into_iter().map(|(_, f)| f).collect();

        assert_eq!(fields, expected, "messages: {messages:?}");
        assert_eq!(numbers, (1..=expected.len() as u64).collect::<Vec<_>>());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quoted_field_spanning_deliveries_is_one_row() {
    let rows = load(vec!["7,\"first".into(), "second\",end".into()]).await;
    assert_eq!(
        rows,
        vec![(1, vec!["7".to_string(), "first\nsecond".to_string(), "end".to_string()])]
    );
}
