use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::app::{Fragment, FunctionCode};
use crate::association::Association;
use crate::error::{Error, Result, TimeoutKind};
use crate::objects::{
    instance, Item, ObjectInstance, PointType, PointValue, Variation,
};

/// One accumulated read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPoint {
    BinaryInput(u16),
    BinaryOutput(u16),
    AnalogInput(u16),
    AnalogOutput(u16),
    Counter(u16),
    /// Class poll, 0..=3.
    Class(u8),
    /// Class 1, 2, 3 events plus class 0 static data.
    Integrity,
}

/// One accumulated write or control command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteCommand {
    Operate {
        index: u16,
        code: u8,
        on_time_ms: u32,
        off_time_ms: u32,
    },
    AnalogOutput {
        index: u16,
        value: i32,
    },
    TimeAndDate {
        unix_ms: u64,
    },
}

/// Outcome for one request, in request order.
#[derive(Debug)]
pub struct Response<R> {
    pub request: R,
    /// Decoded values attributed to this request (`(index, value)` pairs).
    pub values: Vec<(Option<u32>, PointValue)>,
    pub error: Option<String>,
}

impl Response<ReadPoint> {
    pub fn value(&self) -> Option<PointValue> {
        self.values.first().map(|(_, value)| *value)
    }

    /// A point read succeeds when a value came back; a class or integrity
    /// poll succeeds when the exchange did, even if no events were pending.
    pub fn is_success(&self) -> bool {
        if self.error.is_some() {
            return false;
        }
        match self.request {
            ReadPoint::Class(_) | ReadPoint::Integrity => true,
            _ => !self.values.is_empty(),
        }
    }
}

impl Response<WriteCommand> {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Accumulate point reads and commit them as one fragment exchange.
pub struct ReadTransaction {
    association: Arc<Association>,
    requests: Vec<ReadPoint>,
}

impl ReadTransaction {
    pub fn new(association: Arc<Association>) -> Self {
        Self {
            association,
            requests: Vec::new(),
        }
    }

    pub fn read_binary_input(&mut self, index: u16) -> &mut Self {
        self.requests.push(ReadPoint::BinaryInput(index));
        self
    }

    pub fn read_binary_output(&mut self, index: u16) -> &mut Self {
        self.requests.push(ReadPoint::BinaryOutput(index));
        self
    }

    pub fn read_analog_input(&mut self, index: u16) -> &mut Self {
        self.requests.push(ReadPoint::AnalogInput(index));
        self
    }

    pub fn read_analog_output(&mut self, index: u16) -> &mut Self {
        self.requests.push(ReadPoint::AnalogOutput(index));
        self
    }

    pub fn read_counter(&mut self, index: u16) -> &mut Self {
        self.requests.push(ReadPoint::Counter(index));
        self
    }

    pub fn read_class(&mut self, class: u8) -> &mut Self {
        self.requests.push(ReadPoint::Class(class.min(3)));
        self
    }

    pub fn read_integrity(&mut self) -> &mut Self {
        self.requests.push(ReadPoint::Integrity);
        self
    }

    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    /// Drop all pending requests.
    pub fn rollback(&mut self) {
        self.requests.clear();
    }

    /// Send the accumulated reads as one READ request and match the solicited
    /// response back onto the requests, preserving order.
    pub async fn commit(&mut self) -> Result<Vec<Response<ReadPoint>>> {
        if self.requests.is_empty() {
            return Ok(Vec::new());
        }
        let requests = std::mem::take(&mut self.requests);
        let items: Vec<Item> = requests.iter().flat_map(read_items).collect();
        let fragment = exchange(&self.association, FunctionCode::Read, items).await?;
        Ok(requests
            .into_iter()
            .map(|request| match_read(request, &fragment))
            .collect())
    }
}

/// Accumulate commands and commit them as direct-operate / write exchanges.
pub struct WriteTransaction {
    association: Arc<Association>,
    requests: Vec<WriteCommand>,
}

impl WriteTransaction {
    pub fn new(association: Arc<Association>) -> Self {
        Self {
            association,
            requests: Vec::new(),
        }
    }

    /// Latch a binary output on or off.
    pub fn operate_binary(&mut self, index: u16, on: bool) -> &mut Self {
        let code = if on {
            instance::CROB_LATCH_ON
        } else {
            instance::CROB_LATCH_OFF
        };
        self.requests.push(WriteCommand::Operate {
            index,
            code,
            on_time_ms: 0,
            off_time_ms: 0,
        });
        self
    }

    pub fn operate(&mut self, index: u16, code: u8, on_time_ms: u32, off_time_ms: u32) -> &mut Self {
        self.requests.push(WriteCommand::Operate {
            index,
            code,
            on_time_ms,
            off_time_ms,
        });
        self
    }

    pub fn write_analog_output(&mut self, index: u16, value: i32) -> &mut Self {
        self.requests.push(WriteCommand::AnalogOutput { index, value });
        self
    }

    pub fn write_time(&mut self, unix_ms: u64) -> &mut Self {
        self.requests.push(WriteCommand::TimeAndDate { unix_ms });
        self
    }

    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    pub fn rollback(&mut self) {
        self.requests.clear();
    }

    /// Commit the accumulated commands. Controls go out as DIRECT_OPERATE and
    /// are judged by the echoed status octet; time writes go out as WRITE.
    pub async fn commit(&mut self) -> Result<Vec<Response<WriteCommand>>> {
        if self.requests.is_empty() {
            return Ok(Vec::new());
        }
        let requests = std::mem::take(&mut self.requests);

        let controls: Vec<WriteCommand> = requests
            .iter()
            .copied()
            .filter(|request| !matches!(request, WriteCommand::TimeAndDate { .. }))
            .collect();
        let control_echo = if controls.is_empty() {
            None
        } else {
            let items = controls.iter().map(write_item_for).collect();
            Some(exchange(&self.association, FunctionCode::DirectOperate, items).await?)
        };

        let time_writes: Vec<WriteCommand> = requests
            .iter()
            .copied()
            .filter(|request| matches!(request, WriteCommand::TimeAndDate { .. }))
            .collect();
        let time_outcome = if time_writes.is_empty() {
            None
        } else {
            let items = time_writes.iter().map(write_item_for).collect();
            Some(exchange(&self.association, FunctionCode::Write, items).await)
        };

        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            let response = match request {
                WriteCommand::TimeAndDate { unix_ms } => match &time_outcome {
                    Some(Err(err)) => Response {
                        request,
                        values: Vec::new(),
                        error: Some(err.to_string()),
                    },
                    _ => Response {
                        request,
                        values: vec![(None, PointValue::Time(unix_ms))],
                        error: None,
                    },
                },
                WriteCommand::Operate { index, .. } => {
                    match_control(request, index as u32, false, control_echo.as_ref())
                }
                WriteCommand::AnalogOutput { index, .. } => {
                    match_control(request, index as u32, true, control_echo.as_ref())
                }
            };
            responses.push(response);
        }
        Ok(responses)
    }
}

fn read_items(request: &ReadPoint) -> Vec<Item> {
    match *request {
        ReadPoint::BinaryInput(index) => vec![Item::read_range(
            Variation::BinaryInputFlags,
            index as u32,
            index as u32,
        )],
        ReadPoint::BinaryOutput(index) => vec![Item::read_range(
            Variation::BinaryOutputStatus,
            index as u32,
            index as u32,
        )],
        ReadPoint::AnalogInput(index) => vec![Item::read_range(
            Variation::AnalogInput32Flag,
            index as u32,
            index as u32,
        )],
        ReadPoint::AnalogOutput(index) => vec![Item::read_range(
            Variation::AnalogOutputStatus32,
            index as u32,
            index as u32,
        )],
        ReadPoint::Counter(index) => vec![Item::read_range(
            Variation::Counter32Flag,
            index as u32,
            index as u32,
        )],
        ReadPoint::Class(class) => vec![Item::all(class_variation(class))],
        ReadPoint::Integrity => vec![
            Item::all(Variation::Class1Data),
            Item::all(Variation::Class2Data),
            Item::all(Variation::Class3Data),
            Item::all(Variation::Class0Data),
        ],
    }
}

fn class_variation(class: u8) -> Variation {
    match class {
        0 => Variation::Class0Data,
        1 => Variation::Class1Data,
        2 => Variation::Class2Data,
        _ => Variation::Class3Data,
    }
}

fn write_item_for(request: &WriteCommand) -> Item {
    match *request {
        WriteCommand::Operate {
            index,
            code,
            on_time_ms,
            off_time_ms,
        } => Item::indexed_values(
            Variation::ControlRelayOutputBlock,
            vec![(
                index as u32,
                ObjectInstance::crob(code, on_time_ms, off_time_ms),
            )],
        ),
        WriteCommand::AnalogOutput { index, value } => Item::indexed_values(
            Variation::AnalogOutputBlock32,
            vec![(index as u32, ObjectInstance::AnalogI32 { value, flags: Some(0) })],
        ),
        WriteCommand::TimeAndDate { unix_ms } => {
            Item::counted_values(Variation::TimeAndDate, vec![ObjectInstance::TimeMs(unix_ms)])
        }
    }
}

fn point_type_for(request: ReadPoint) -> Option<PointType> {
    match request {
        ReadPoint::BinaryInput(_) => Some(PointType::BinaryInput),
        ReadPoint::BinaryOutput(_) => Some(PointType::BinaryOutput),
        ReadPoint::AnalogInput(_) => Some(PointType::AnalogInput),
        ReadPoint::AnalogOutput(_) => Some(PointType::AnalogOutput),
        ReadPoint::Counter(_) => Some(PointType::Counter),
        ReadPoint::Class(_) | ReadPoint::Integrity => None,
    }
}

fn request_index(request: ReadPoint) -> Option<u16> {
    match request {
        ReadPoint::BinaryInput(index)
        | ReadPoint::BinaryOutput(index)
        | ReadPoint::AnalogInput(index)
        | ReadPoint::AnalogOutput(index)
        | ReadPoint::Counter(index) => Some(index),
        ReadPoint::Class(_) | ReadPoint::Integrity => None,
    }
}

fn match_read(request: ReadPoint, fragment: &Fragment) -> Response<ReadPoint> {
    match (point_type_for(request), request_index(request)) {
        (Some(point_type), Some(index)) => {
            let mut values = Vec::new();
            for item in &fragment.items {
                if item.variation.descriptor().point_type != point_type {
                    continue;
                }
                for (position, instance) in item.instances.iter().enumerate() {
                    if item.index_of(position) == Some(index as u32) {
                        if let Some(value) = instance.as_point_value() {
                            values.push((Some(index as u32), value));
                        }
                    }
                }
            }
            let error = values
                .is_empty()
                .then(|| format!("no value returned for index {index}"));
            Response {
                request,
                values,
                error,
            }
        }
        _ => {
            // Class data: every returned value belongs to the poll.
            Response {
                request,
                values: fragment.point_values(),
                error: None,
            }
        }
    }
}

fn match_control(
    request: WriteCommand,
    want_index: u32,
    want_analog: bool,
    echo: Option<&Fragment>,
) -> Response<WriteCommand> {
    let Some(echo) = echo else {
        return Response {
            request,
            values: Vec::new(),
            error: Some("no control exchange performed".to_string()),
        };
    };
    for item in &echo.items {
        for (position, echoed) in item.instances.iter().enumerate() {
            if item.index_of(position) != Some(want_index) {
                continue;
            }
            match (echoed, want_analog) {
                (ObjectInstance::Crob { status, .. }, false) => {
                    return control_outcome(request, echoed, *status);
                }
                (ObjectInstance::AnalogI32 { flags, .. }, true) => {
                    return control_outcome(request, echoed, flags.unwrap_or(0));
                }
                _ => {}
            }
        }
    }
    Response {
        request,
        values: Vec::new(),
        error: Some(format!("no echo for index {want_index}")),
    }
}

fn control_outcome(
    request: WriteCommand,
    echoed: &ObjectInstance,
    status: u8,
) -> Response<WriteCommand> {
    if status == 0 {
        Response {
            request,
            values: echoed
                .as_point_value()
                .map(|value| vec![(None, value)])
                .unwrap_or_default(),
            error: None,
        }
    } else {
        Response {
            request,
            values: Vec::new(),
            error: Some(format!("control status {status}")),
        }
    }
}

/// One request/response exchange on the association. Connection failures
/// disconnect the association and surface as `ServiceNotAvailable`.
async fn exchange(
    association: &Arc<Association>,
    function: FunctionCode,
    items: Vec<Item>,
) -> Result<Fragment> {
    let app = association.application_layer().clone();
    let reply_timeout = association
        .remote_endpoint()
        .map(|endpoint| endpoint.reply_timeout())
        .unwrap_or(Duration::from_secs(2));

    let seq = app.next_solicited_sequence();
    association.record_request_sequence(seq);
    let waiter = association.register_response_waiter();
    debug!(seq, ?function, "transaction exchange");

    if let Err(err) = app.send_request_with_seq(function, items, false, seq).await {
        return Err(service_failure(association, err));
    }

    match timeout(reply_timeout, waiter).await {
        Ok(Ok(Ok(fragment))) => Ok(fragment),
        // Fragment-level protocol error: the association stays live.
        Ok(Ok(Err(protocol))) => Err(Error::Protocol(protocol)),
        // Waiter dropped: the connection went away under us.
        Ok(Err(_)) => Err(service_failure(association, Error::ClosedChannel)),
        Err(_) => Err(Error::Timeout(TimeoutKind::Response, reply_timeout)),
    }
}

/// Disconnect the association's endpoint on a connection error and map the
/// error to `ServiceNotAvailable`.
fn service_failure(association: &Arc<Association>, err: Error) -> Error {
    match err {
        Error::Io(_) | Error::ClosedChannel | Error::ServiceNotAvailable(_) => {
            if let Some(endpoint) = association.remote_endpoint() {
                endpoint.request_disconnect(Some(err.to_string()));
            }
            Error::ServiceNotAvailable(err.to_string())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppControl, Iin};
    use crate::link::Outbound;
    use std::sync::Weak;

    fn association() -> Arc<Association> {
        Association::new(
            2,
            1,
            true,
            Weak::new(),
            Outbound::new(),
            Duration::from_millis(100),
            Duration::from_millis(100),
            2048,
        )
    }

    #[tokio::test]
    async fn empty_commit_returns_no_responses() {
        let mut transaction = ReadTransaction::new(association());
        assert!(transaction.commit().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rollback_drops_pending_requests() {
        let mut transaction = ReadTransaction::new(association());
        transaction.read_binary_input(7).read_analog_input(2);
        assert_eq!(transaction.pending(), 2);
        transaction.rollback();
        assert_eq!(transaction.pending(), 0);
        assert!(transaction.commit().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_without_connection_is_service_not_available() {
        let mut transaction = ReadTransaction::new(association());
        transaction.read_binary_input(7);
        // No connection bound: the send path fails and the transaction maps
        // it onto ServiceNotAvailable.
        match transaction.commit().await {
            Err(Error::ServiceNotAvailable(_)) => {}
            other => panic!("expected ServiceNotAvailable, got {other:?}"),
        }
    }

    #[test]
    fn integrity_poll_reads_all_classes() {
        let items = read_items(&ReadPoint::Integrity);
        let groups: Vec<(u8, u8)> = items.iter().map(|i| i.variation.group_var()).collect();
        assert_eq!(groups, vec![(60, 2), (60, 3), (60, 4), (60, 1)]);
    }

    #[test]
    fn read_response_matching_by_index_and_type() {
        let fragment = Fragment::response(
            FunctionCode::Response,
            AppControl::single(0),
            Iin::new(),
            vec![
                Item::range_values(
                    Variation::BinaryInputFlags,
                    7,
                    vec![ObjectInstance::binary(true)],
                ),
                Item::range_values(
                    Variation::AnalogInput32Flag,
                    7,
                    vec![ObjectInstance::AnalogI32 {
                        value: 42,
                        flags: Some(instance::FLAG_ONLINE),
                    }],
                ),
            ],
        );
        let binary = match_read(ReadPoint::BinaryInput(7), &fragment);
        assert!(binary.is_success());
        assert_eq!(binary.value(), Some(PointValue::Binary(true)));

        let analog = match_read(ReadPoint::AnalogInput(7), &fragment);
        assert!(analog.is_success());
        assert_eq!(analog.value(), Some(PointValue::Analog(42.0)));

        let missing = match_read(ReadPoint::Counter(7), &fragment);
        assert!(!missing.is_success());
        assert!(missing.error.is_some());
    }

    #[test]
    fn empty_class_poll_is_success() {
        let fragment = Fragment::response(
            FunctionCode::Response,
            AppControl::single(0),
            Iin::new(),
            vec![],
        );
        let response = match_read(ReadPoint::Class(1), &fragment);
        assert!(response.is_success());
        assert!(response.values.is_empty());
    }

    #[test]
    fn crob_echo_status_selects_outcome() {
        let ok_echo = Fragment::response(
            FunctionCode::Response,
            AppControl::single(0),
            Iin::new(),
            vec![Item::indexed_values(
                Variation::ControlRelayOutputBlock,
                vec![(3, ObjectInstance::crob(instance::CROB_LATCH_ON, 100, 0))],
            )],
        );
        let request = WriteCommand::Operate {
            index: 3,
            code: instance::CROB_LATCH_ON,
            on_time_ms: 100,
            off_time_ms: 0,
        };
        assert!(match_control(request, 3, false, Some(&ok_echo)).is_success());

        let failed_echo = Fragment::response(
            FunctionCode::Response,
            AppControl::single(0),
            Iin::new(),
            vec![Item::indexed_values(
                Variation::ControlRelayOutputBlock,
                vec![(
                    3,
                    ObjectInstance::Crob {
                        code: instance::CROB_LATCH_ON,
                        count: 1,
                        on_time_ms: 100,
                        off_time_ms: 0,
                        status: 4,
                    },
                )],
            )],
        );
        let failed = match_control(request, 3, false, Some(&failed_echo));
        assert!(!failed.is_success());
        assert_eq!(failed.error.as_deref(), Some("control status 4"));

        let no_echo = Fragment::response(
            FunctionCode::Response,
            AppControl::single(0),
            Iin::new(),
            vec![],
        );
        assert!(!match_control(request, 3, false, Some(&no_echo)).is_success());
    }
}
