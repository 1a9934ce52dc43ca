use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procura_core::{Aggregate, AggregateId, AggregateRoot, DomainError, UserId};
use procura_events::Event;
use procura_products::ProductId;

/// Purchase order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseOrderId(pub AggregateId);

impl PurchaseOrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PurchaseOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Purchase order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOrderStatus {
    Draft,
    Pending,
    PartiallyReceived,
    Received,
    Cancelled,
}

impl PurchaseOrderStatus {
    /// Received and Cancelled are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Received | Self::Cancelled)
    }
}

/// What the order was created from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum OrderSource {
    WishlistEntry(AggregateId),
    Application(AggregateId),
}

/// Purchase order line item. Invariant: `received <= ordered`, always.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub ordered: i64,
    pub received: i64,
}

impl OrderLine {
    pub fn fully_received(&self) -> bool {
        self.received == self.ordered
    }
}

/// A line as requested at creation time (before numbering).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLine {
    pub product_id: ProductId,
    pub quantity: i64,
}

/// Aggregate root: PurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    id: PurchaseOrderId,
    source: Option<OrderSource>,
    created_by: Option<UserId>,
    status: PurchaseOrderStatus,
    lines: Vec<OrderLine>,
    version: u64,
    created: bool,
}

impl PurchaseOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PurchaseOrderId) -> Self {
        Self {
            id,
            source: None,
            created_by: None,
            status: PurchaseOrderStatus::Draft,
            lines: Vec::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PurchaseOrderId {
        self.id
    }

    pub fn source(&self) -> Option<OrderSource> {
        self.source
    }

    pub fn created_by(&self) -> Option<UserId> {
        self.created_by
    }

    pub fn status(&self) -> PurchaseOrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn line(&self, line_no: u32) -> Option<&OrderLine> {
        self.lines.iter().find(|l| l.line_no == line_no)
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: DraftOrder (manual path; lines added before submission).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftOrder {
    pub order_id: PurchaseOrderId,
    pub source: Option<OrderSource>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddLine (only allowed in Draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLine {
    pub order_id: PurchaseOrderId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SubmitOrder (Draft → Pending).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOrder {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: OpenOrder (create directly at Pending with its lines; the
/// conversion path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: PurchaseOrderId,
    pub source: Option<OrderSource>,
    pub created_by: UserId,
    pub lines: Vec<NewLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordReceipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReceipt {
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub quantity: i64,
    pub received_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder (Draft or Pending only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderCommand {
    DraftOrder(DraftOrder),
    AddLine(AddLine),
    SubmitOrder(SubmitOrder),
    OpenOrder(OpenOrder),
    RecordReceipt(RecordReceipt),
    CancelOrder(CancelOrder),
}

/// Event: OrderDrafted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDrafted {
    pub order_id: PurchaseOrderId,
    pub source: Option<OrderSource>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderLineAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderLineAdded {
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderSubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSubmitted {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderOpened (created at Pending with all lines).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderOpened {
    pub order_id: PurchaseOrderId,
    pub source: Option<OrderSource>,
    pub created_by: UserId,
    pub lines: Vec<OrderLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReceiptRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRecorded {
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: i64,
    pub received_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderEvent {
    OrderDrafted(OrderDrafted),
    PurchaseOrderLineAdded(PurchaseOrderLineAdded),
    OrderSubmitted(OrderSubmitted),
    OrderOpened(OrderOpened),
    ReceiptRecorded(ReceiptRecorded),
    OrderCancelled(OrderCancelled),
}

impl Event for PurchaseOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseOrderEvent::OrderDrafted(_) => "purchasing.order.drafted",
            PurchaseOrderEvent::PurchaseOrderLineAdded(_) => "purchasing.order.line_added",
            PurchaseOrderEvent::OrderSubmitted(_) => "purchasing.order.submitted",
            PurchaseOrderEvent::OrderOpened(_) => "purchasing.order.opened",
            PurchaseOrderEvent::ReceiptRecorded(_) => "purchasing.order.receipt_recorded",
            PurchaseOrderEvent::OrderCancelled(_) => "purchasing.order.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseOrderEvent::OrderDrafted(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderLineAdded(e) => e.occurred_at,
            PurchaseOrderEvent::OrderSubmitted(e) => e.occurred_at,
            PurchaseOrderEvent::OrderOpened(e) => e.occurred_at,
            PurchaseOrderEvent::ReceiptRecorded(e) => e.occurred_at,
            PurchaseOrderEvent::OrderCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PurchaseOrder {
    type Command = PurchaseOrderCommand;
    type Event = PurchaseOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseOrderEvent::OrderDrafted(e) => {
                self.id = e.order_id;
                self.source = e.source;
                self.created_by = Some(e.created_by);
                self.status = PurchaseOrderStatus::Draft;
                self.lines.clear();
                self.created = true;
            }
            PurchaseOrderEvent::PurchaseOrderLineAdded(e) => {
                self.lines.push(OrderLine {
                    line_no: e.line_no,
                    product_id: e.product_id,
                    ordered: e.quantity,
                    received: 0,
                });
            }
            PurchaseOrderEvent::OrderSubmitted(_) => {
                self.status = PurchaseOrderStatus::Pending;
            }
            PurchaseOrderEvent::OrderOpened(e) => {
                self.id = e.order_id;
                self.source = e.source;
                self.created_by = Some(e.created_by);
                self.status = PurchaseOrderStatus::Pending;
                self.lines = e.lines.clone();
                self.created = true;
            }
            PurchaseOrderEvent::ReceiptRecorded(e) => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == e.line_no) {
                    line.received += e.quantity;
                }
                self.status = self.recompute_status();
            }
            PurchaseOrderEvent::OrderCancelled(_) => {
                self.status = PurchaseOrderStatus::Cancelled;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseOrderCommand::DraftOrder(cmd) => self.handle_draft(cmd),
            PurchaseOrderCommand::AddLine(cmd) => self.handle_add_line(cmd),
            PurchaseOrderCommand::SubmitOrder(cmd) => self.handle_submit(cmd),
            PurchaseOrderCommand::OpenOrder(cmd) => self.handle_open(cmd),
            PurchaseOrderCommand::RecordReceipt(cmd) => self.handle_receipt(cmd),
            PurchaseOrderCommand::CancelOrder(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl PurchaseOrder {
    /// Received when every line is fully received; PartiallyReceived when
    /// some but not all lines are; otherwise the status stays as it was.
    fn recompute_status(&self) -> PurchaseOrderStatus {
        let full = self.lines.iter().filter(|l| l.fully_received()).count();
        if !self.lines.is_empty() && full == self.lines.len() {
            PurchaseOrderStatus::Received
        } else if full > 0 {
            PurchaseOrderStatus::PartiallyReceived
        } else {
            self.status
        }
    }

    fn ensure_order_id(&self, order_id: PurchaseOrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn handle_draft(&self, cmd: &DraftOrder) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("purchase order already exists"));
        }

        Ok(vec![PurchaseOrderEvent::OrderDrafted(OrderDrafted {
            order_id: cmd.order_id,
            source: cmd.source,
            created_by: cmd.created_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_line(&self, cmd: &AddLine) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;

        if self.status != PurchaseOrderStatus::Draft {
            return Err(DomainError::invalid_transition(
                "lines can only be added to draft orders",
            ));
        }
        if cmd.quantity <= 0 {
            return Err(DomainError::validation("ordered quantity must be positive"));
        }

        let next_line_no = (self.lines.len() as u32) + 1;
        Ok(vec![PurchaseOrderEvent::PurchaseOrderLineAdded(
            PurchaseOrderLineAdded {
                order_id: cmd.order_id,
                line_no: next_line_no,
                product_id: cmd.product_id,
                quantity: cmd.quantity,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_submit(&self, cmd: &SubmitOrder) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;

        if self.status != PurchaseOrderStatus::Draft {
            return Err(DomainError::invalid_transition(
                "only draft orders can be submitted",
            ));
        }
        if self.lines.is_empty() {
            return Err(DomainError::validation(
                "cannot submit an order without lines",
            ));
        }

        Ok(vec![PurchaseOrderEvent::OrderSubmitted(OrderSubmitted {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_open(&self, cmd: &OpenOrder) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("purchase order already exists"));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation(
                "cannot open an order without lines",
            ));
        }

        let mut lines = Vec::with_capacity(cmd.lines.len());
        for (idx, line) in cmd.lines.iter().enumerate() {
            if line.quantity <= 0 {
                return Err(DomainError::validation(format!(
                    "ordered quantity must be positive (line {})",
                    idx + 1
                )));
            }
            lines.push(OrderLine {
                line_no: (idx as u32) + 1,
                product_id: line.product_id,
                ordered: line.quantity,
                received: 0,
            });
        }

        Ok(vec![PurchaseOrderEvent::OrderOpened(OrderOpened {
            order_id: cmd.order_id,
            source: cmd.source,
            created_by: cmd.created_by,
            lines,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receipt(&self, cmd: &RecordReceipt) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;

        match self.status {
            PurchaseOrderStatus::Pending | PurchaseOrderStatus::PartiallyReceived => {}
            other => {
                return Err(DomainError::invalid_transition(format!(
                    "cannot record a receipt against a {other:?} order"
                )));
            }
        }

        if cmd.quantity <= 0 {
            return Err(DomainError::validation("received quantity must be positive"));
        }

        let line = self
            .line(cmd.line_no)
            .ok_or_else(|| DomainError::validation(format!("no such line: {}", cmd.line_no)))?;

        // Compared against the remaining headroom so an enormous quantity
        // cannot overflow the sum.
        if cmd.quantity > line.ordered - line.received {
            return Err(DomainError::OverReceipt {
                line_no: cmd.line_no,
                ordered: line.ordered,
                already_received: line.received,
                attempted: cmd.quantity,
            });
        }

        Ok(vec![PurchaseOrderEvent::ReceiptRecorded(ReceiptRecorded {
            order_id: cmd.order_id,
            line_no: cmd.line_no,
            product_id: line.product_id,
            quantity: cmd.quantity,
            received_by: cmd.received_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;

        match self.status {
            PurchaseOrderStatus::Draft | PurchaseOrderStatus::Pending => {}
            other => {
                // Received goods must be reversed via compensating
                // adjustments, not cancellation.
                return Err(DomainError::invalid_transition(format!(
                    "cannot cancel a {other:?} order"
                )));
            }
        }

        Ok(vec![PurchaseOrderEvent::OrderCancelled(OrderCancelled {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}
