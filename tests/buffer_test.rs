#[cfg(test)]
mod tests {
    use agentry::chat::buffer::{BufferCallback, BufferEvent, DisplayBuffer, LogCodeSink};
    use agentry::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn collector() -> (BufferCallback, Arc<Mutex<Vec<BufferEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: BufferCallback = Arc::new(move |e: BufferEvent| sink.lock().unwrap().push(e));
        (callback, events)
    }

    fn lines(text: &str) -> Vec<String> {
        text.split_inclusive('\n').map(str::to_string).collect()
    }

    fn prose(events: &[BufferEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                BufferEvent::Content(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn ends(events: &[BufferEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, BufferEvent::End { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_concurrent_pumps_finalize_once() {
        let buffer = DisplayBuffer::new(Duration::ZERO, Arc::new(LogCodeSink));
        let (cb, events) = collector();
        buffer.begin_turn("hi", cb);
        buffer.append_lines(lines("one\ntwo\nthree\n"));
        buffer.finish_input();

        tokio::join!(buffer.process_buffer(), buffer.process_buffer());

        let events = events.lock().unwrap().clone();
        assert_eq!(ends(&events), 1);
        assert_eq!(prose(&events), "one\ntwo\nthree\n");
        assert_eq!(
            buffer.history(),
            vec![
                ConvMessage::user("hi"),
                ConvMessage::assistant("one\ntwo\nthree")
            ]
        );
    }

    #[tokio::test]
    async fn test_lines_arriving_while_pumping() {
        let buffer = DisplayBuffer::new(Duration::ZERO, Arc::new(LogCodeSink));
        let (cb, events) = collector();
        buffer.begin_turn("hi", cb);

        buffer.append_lines(lines("first\n"));
        buffer.process_buffer().await;
        assert_eq!(ends(&events.lock().unwrap()), 0);
        assert!(buffer.status().buffering);

        buffer.append_lines(lines("second\n"));
        buffer.finish_input();
        buffer.process_buffer().await;

        let events = events.lock().unwrap().clone();
        assert_eq!(prose(&events), "first\nsecond\n");
        assert_eq!(
            events.last(),
            Some(&BufferEvent::End {
                message: "first\nsecond".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_pacing_does_not_leak_into_next_turn() {
        let buffer = DisplayBuffer::new(Duration::from_millis(5), Arc::new(LogCodeSink));
        let (first_cb, first_events) = collector();
        buffer.begin_turn("first", first_cb);
        buffer.append_lines(lines("abcdefghijkl\n"));
        buffer.finish_input();

        let pump = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.process_buffer().await })
        };
        tokio::time::sleep(Duration::from_millis(7)).await;
        buffer.stop_chat();

        let (second_cb, second_events) = collector();
        buffer.begin_turn("second", second_cb);
        buffer.append_lines(lines("ok\n"));
        buffer.finish_input();
        buffer.process_buffer().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        pump.await.unwrap();

        let first = first_events.lock().unwrap().clone();
        assert_eq!(first.last(), Some(&BufferEvent::Interrupted));
        assert_eq!(ends(&first), 0);
        assert!(prose(&first).len() < "abcdefghijkl\n".len());

        let second = second_events.lock().unwrap().clone();
        assert_eq!(prose(&second), "ok\n");
        assert_eq!(
            second.last(),
            Some(&BufferEvent::End {
                message: "ok".into()
            })
        );

        assert_eq!(
            buffer.history(),
            vec![
                ConvMessage::user("first"),
                ConvMessage::user("second"),
                ConvMessage::assistant("ok")
            ]
        );
        assert!(!buffer.status().processing);
    }

    #[tokio::test]
    async fn test_abort_removes_unanswered_message() {
        let buffer = DisplayBuffer::new(Duration::ZERO, Arc::new(LogCodeSink));
        let (cb, events) = collector();
        buffer.begin_turn("hi", cb);
        buffer.append_lines(lines("partial\n"));
        buffer.abort_turn();
        buffer.process_buffer().await;

        assert!(events.lock().unwrap().is_empty());
        assert!(buffer.history().is_empty());
    }
}
